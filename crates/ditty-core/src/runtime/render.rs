//! The render callback.
//!
//! Runs on the audio host's thread. It owns the final output bus and hands
//! the device fixed-size slices of a larger macro-buffer, refilling the
//! macro-buffer from the bus whenever it has been consumed. It never blocks
//! and never logs: control arrives through a bounded channel drained at the
//! top of each call, telemetry leaves through `try_send` and the
//! [`MeterBank`] atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::bus::AudioBus;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::messages::{RenderControl, RenderEvent};
use crate::timing::Transport;

/// Output levels readable from any thread.
#[derive(Debug)]
pub struct MeterBank {
    master: AtomicU32,
    inputs: Vec<AtomicU32>,
    underruns: AtomicU64,
    buffers: AtomicU64,
}

impl MeterBank {
    /// A bank metering up to `slots` bus inputs.
    pub fn new(slots: usize) -> Self {
        Self {
            master: AtomicU32::new(0),
            inputs: (0..slots).map(|_| AtomicU32::new(0)).collect(),
            underruns: AtomicU64::new(0),
            buffers: AtomicU64::new(0),
        }
    }

    pub fn slots(&self) -> usize {
        self.inputs.len()
    }

    pub fn master(&self) -> f32 {
        f32::from_bits(self.master.load(Ordering::Relaxed))
    }

    /// Level of the bus input at `slot`.
    pub fn input(&self, slot: usize) -> f32 {
        self.inputs
            .get(slot)
            .map_or(0.0, |v| f32::from_bits(v.load(Ordering::Relaxed)))
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Macro-buffers played since the bank was created.
    pub fn buffers(&self) -> u64 {
        self.buffers.load(Ordering::Relaxed)
    }

    fn capture(&self, bus: &AudioBus) {
        for ((_, volume), slot) in bus.levels().zip(&self.inputs) {
            slot.store(volume.to_bits(), Ordering::Relaxed);
        }
        if let Some(master) = bus.master_level() {
            self.master.store(master.to_bits(), Ordering::Relaxed);
        }
        self.buffers.fetch_add(1, Ordering::Relaxed);
    }

    fn clear(&self) {
        self.master.store(0, Ordering::Relaxed);
        for slot in &self.inputs {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// What a render call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Audio from the bus.
    Played,
    /// The bus had no data; some or all of the output is silence.
    Starved,
    /// No bus is installed.
    Suspended,
}

pub struct RenderCallback {
    control: Receiver<RenderControl>,
    events: Sender<RenderEvent>,
    bus: Option<Box<AudioBus>>,
    // a replaced bus waiting for room in the event channel
    retiring: Option<Box<AudioBus>>,
    // control held back until `retiring` is handed over
    deferred: Option<RenderControl>,
    macro_buffer: Vec<f32>,
    position: usize,
    transport: Transport,
    meters: Arc<MeterBank>,
}

impl RenderCallback {
    pub fn new(
        config: &EngineConfig,
        control: Receiver<RenderControl>,
        events: Sender<RenderEvent>,
        meters: Arc<MeterBank>,
    ) -> Result<Self> {
        Ok(Self {
            control,
            events,
            bus: None,
            retiring: None,
            deferred: None,
            macro_buffer: vec![0.0; config.buffer_length * 2],
            position: 0,
            transport: Transport::new(config.bpm, config.sample_rate)?,
            meters,
        })
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Device entry point. Always asks the host to keep going.
    pub fn process(&mut self, out: &mut [f32]) -> bool {
        self.render(out);
        true
    }

    /// Fill `out` (interleaved stereo) and report what was played.
    pub fn render(&mut self, out: &mut [f32]) -> RenderOutcome {
        self.drain_control();

        let Some(bus) = self.bus.as_mut() else {
            out.fill(0.0);
            return RenderOutcome::Suspended;
        };

        let mut written = 0;
        while written < out.len() {
            if self.position == 0 {
                if !bus.pull(&mut self.macro_buffer) {
                    if let Some(input) = bus.take_underrun() {
                        self.meters.underruns.fetch_add(1, Ordering::Relaxed);
                        let _ = self.events.try_send(RenderEvent::Underrun { input });
                    }
                    out[written..].fill(0.0);
                    return RenderOutcome::Starved;
                }
                self.meters.capture(bus);
                self.transport.advance_frames(self.macro_buffer.len() / 2);
                let _ = self.events.try_send(RenderEvent::Update {
                    tick: self.transport.tick(),
                    time: self.transport.time(),
                    bpm: self.transport.bpm(),
                });
            }

            let count = (out.len() - written).min(self.macro_buffer.len() - self.position);
            out[written..written + count]
                .copy_from_slice(&self.macro_buffer[self.position..self.position + count]);
            written += count;
            self.position = (self.position + count) % self.macro_buffer.len();
        }
        RenderOutcome::Played
    }

    fn drain_control(&mut self) {
        self.flush_retired();
        loop {
            let message = match self.deferred.take() {
                Some(message) => message,
                None => match self.control.try_recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            let replaces_bus = matches!(message, RenderControl::Init { .. } | RenderControl::Reset);
            if replaces_bus && self.bus.is_some() && self.retiring.is_some() {
                // the old bus keeps playing until the previous one is handed over
                self.deferred = Some(message);
                break;
            }
            self.apply(message);
        }
    }

    fn apply(&mut self, message: RenderControl) {
        match message {
            RenderControl::Init { bus, bpm } => {
                self.retire();
                self.bus = Some(bus);
                self.transport.reset();
                let _ = self.transport.set_bpm(bpm);
                self.position = 0;
            }
            RenderControl::Reset => {
                self.retire();
                self.transport.reset();
                self.position = 0;
                self.meters.clear();
            }
            RenderControl::SetGain(update) => {
                if let Some(bus) = self.bus.as_mut() {
                    bus.set_gain(&update);
                }
            }
            RenderControl::SetBpm(bpm) => {
                let _ = self.transport.set_bpm(bpm);
            }
        }
    }

    /// Hand the current bus back to be dropped elsewhere.
    fn retire(&mut self) {
        if let Some(old) = self.bus.take() {
            self.retiring = Some(old);
            self.flush_retired();
        }
    }

    /// Send the retiring bus to the session, keeping it if the channel is full.
    fn flush_retired(&mut self) {
        let Some(old) = self.retiring.take() else {
            return;
        };
        match self.events.try_send(RenderEvent::Retired(old)) {
            Ok(()) => {}
            Err(TrySendError::Full(RenderEvent::Retired(old)))
            | Err(TrySendError::Disconnected(RenderEvent::Retired(old))) => self.retiring = Some(old),
            Err(_) => {}
        }
    }
}

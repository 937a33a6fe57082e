//! The session orchestrator.
//!
//! A [`Session`] owns the generator tasks, the control side of the render
//! callback and the audio host. It turns a compiled [`ScoreStructure`] into a
//! task graph: one buffer link per task, each shared filter reading the links
//! of the tasks that feed it, and the output bus reading the rest.
//!
//! The session is also the only place that reacts to failures. A task that
//! reports an error is torn down and the whole session stops.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::api::analyze;
use crate::bus::{allocate_buffers, buffer_link, AudioBus, GainUpdate, InputPort};
use crate::config::EngineConfig;
use crate::debug::{DebugBatch, DebugLevel};
use crate::error::{DittyError, Result};
use crate::messages::{
    ControlMessage, InitPayload, LevelReading, NoteEvent, PeriodicUpdate, RenderControl, RenderEvent, TaskEvent,
};
use crate::topology::ScoreStructure;

use super::generator::{self, GeneratorHandle};
use super::host::AudioHost;
use super::render::{MeterBank, RenderCallback};

const RENDER_CONTROL_CAPACITY: usize = 64;
const RENDER_EVENT_CAPACITY: usize = 1024;

/// Output bus inputs that get a level meter.
pub const METER_SLOTS: usize = 64;

/// Something observable happened in a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Compiled(ScoreStructure),
    Played,
    Paused,
    Resumed,
    Stopped,
    Note(NoteEvent),
    Update(PeriodicUpdate),
    /// Render transport position, once per macro-buffer.
    Transport { tick: f64, time: f64, bpm: f64 },
    Underrun { input: String },
    Error { source: String, message: String },
}

pub struct Session<H: AudioHost> {
    config: EngineConfig,
    host: H,
    render_control: Sender<RenderControl>,
    render_events: Receiver<RenderEvent>,
    task_events_tx: Sender<TaskEvent>,
    task_events: Receiver<TaskEvent>,
    meters: Arc<MeterBank>,
    generators: BTreeMap<String, GeneratorHandle>,
    code: Option<String>,
    structure: Option<ScoreStructure>,
    output_names: Vec<String>,
    params: Vec<(String, f64)>,
    input_gains: BTreeMap<String, f32>,
    master_gain: Option<f32>,
    // tempo the render transport was last given
    render_bpm: f64,
    subscribers: Vec<Sender<SessionEvent>>,
    paused: bool,
    stopped: bool,
}

impl<H: AudioHost> Session<H> {
    /// Create a stopped session rendering through `host`.
    ///
    /// A host that dictates its sample rate overrides the configured one.
    pub fn new(config: EngineConfig, mut host: H) -> Result<Self> {
        let config = match host.sample_rate() {
            Some(rate) if rate != config.sample_rate => {
                log::info!("[SESSION] using the device sample rate of {} Hz", rate);
                config.with_sample_rate(rate)
            }
            _ => config,
        };
        config.validate()?;

        let (render_control, control_rx) = bounded(RENDER_CONTROL_CAPACITY);
        let (render_tx, render_events) = bounded(RENDER_EVENT_CAPACITY);
        let (task_events_tx, task_events) = unbounded();
        let meters = Arc::new(MeterBank::new(METER_SLOTS));
        let render_bpm = config.bpm;

        let callback = RenderCallback::new(&config, control_rx, render_tx, meters.clone())?;
        host.install(callback)?;

        Ok(Self {
            config,
            host,
            render_control,
            render_events,
            task_events_tx,
            task_events,
            meters,
            generators: BTreeMap::new(),
            code: None,
            structure: None,
            output_names: Vec::new(),
            params: Vec::new(),
            input_gains: BTreeMap::new(),
            master_gain: None,
            render_bpm,
            subscribers: Vec::new(),
            paused: true,
            stopped: true,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Structure of the last score that compiled.
    pub fn structure(&self) -> Option<&ScoreStructure> {
        self.structure.as_ref()
    }

    /// Names of the running generator tasks.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.generators.keys().map(String::as_str)
    }

    /// Receive every event dispatched from now on.
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Dry-run `code` and keep it for the next `play`.
    ///
    /// On error nothing changes: the previous score and anything playing stay.
    pub fn compile(&mut self, code: &str) -> Result<()> {
        let structure = match analyze(code, &self.config) {
            Ok(structure) => structure,
            Err(e) => {
                log::error!("[SESSION] compile failed: {}", e);
                self.dispatch(SessionEvent::Error {
                    source: "compile".to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        log::info!(
            "[SESSION] compiled {} loop(s) and {} filter(s) at {} bpm",
            structure.loops.len(),
            structure.filters.len(),
            structure.bpm
        );
        self.code = Some(code.to_string());
        self.structure = Some(structure.clone());
        self.dispatch(SessionEvent::Compiled(structure));
        Ok(())
    }

    /// Start the compiled score from the beginning.
    ///
    /// Tasks still in the score are reused, new ones spawned and those no
    /// longer needed shut down.
    pub fn play(&mut self) -> Result<()> {
        let (code, structure) = match (&self.code, &self.structure) {
            (Some(code), Some(structure)) => (code.clone(), structure.clone()),
            _ => return Err(DittyError::Config("no score compiled".to_string())),
        };

        self.sync_generators(&structure)?;

        let tasks = structure.tasks();
        let mut outputs = BTreeMap::new();
        let mut inputs: BTreeMap<String, InputPort> = BTreeMap::new();
        for task in &tasks {
            let (output, input) = buffer_link(&task.name, self.config.num_buffers);
            outputs.insert(task.name.clone(), output);
            inputs.insert(task.name.clone(), input);
        }

        let gains = self.gain_update();
        for task in &tasks {
            let output = outputs
                .remove(&task.name)
                .ok_or_else(|| DittyError::UnknownNode(task.name.clone()))?;
            let task_inputs = structure
                .inputs_of(task)
                .iter()
                .filter_map(|source| inputs.remove(&source.name))
                .collect();
            let payload = InitPayload {
                entry: (*task).clone(),
                code: code.clone(),
                params: self.params.clone(),
                gains: gains.clone(),
                output,
                buffers: allocate_buffers(&self.config),
                inputs: task_inputs,
            };
            self.generators
                .get(&task.name)
                .ok_or_else(|| DittyError::UnknownNode(task.name.clone()))?
                .send(ControlMessage::Init(Box::new(payload)))?;
        }

        let ports: Vec<InputPort> = structure
            .outputs()
            .iter()
            .filter_map(|entry| inputs.remove(&entry.name))
            .collect();
        self.output_names = ports.iter().map(|p| p.name().to_string()).collect();
        let mut bus = AudioBus::new(ports, &self.config, true);
        bus.set_gain(&gains);
        self.send_render(RenderControl::Init {
            bus: Box::new(bus),
            bpm: structure.bpm,
        })?;
        self.render_bpm = structure.bpm;

        self.host.resume()?;
        self.paused = false;
        self.stopped = false;
        log::info!("[SESSION] playing {} task(s)", tasks.len());
        self.dispatch(SessionEvent::Played);
        Ok(())
    }

    /// Suspend the render clock. Tasks keep rendering until their buffers are full.
    pub fn pause(&mut self) -> Result<()> {
        if self.stopped || self.paused {
            return Ok(());
        }
        self.host.suspend()?;
        self.paused = true;
        log::info!("[SESSION] paused");
        self.dispatch(SessionEvent::Paused);
        Ok(())
    }

    /// Continue after `pause`. A stopped session starts playing again.
    pub fn resume(&mut self) -> Result<()> {
        if self.stopped {
            return self.play();
        }
        if !self.paused {
            return Ok(());
        }
        self.host.resume()?;
        self.paused = false;
        log::info!("[SESSION] resumed");
        self.dispatch(SessionEvent::Resumed);
        Ok(())
    }

    /// Reset every task and suspend the render clock. Tasks stay alive, idle.
    pub fn stop(&mut self) -> Result<()> {
        for handle in self.generators.values() {
            if let Err(e) = handle.send(ControlMessage::Reset) {
                log::debug!("[SESSION] {}", e);
            }
        }
        self.send_render(RenderControl::Reset)?;
        self.host.suspend()?;
        self.paused = true;
        self.stopped = true;
        log::info!("[SESSION] stopped");
        self.dispatch(SessionEvent::Stopped);
        Ok(())
    }

    /// Push input values to every task. Later values for a key replace earlier ones.
    pub fn set_params(&mut self, params: &[(String, f64)]) -> Result<()> {
        for (key, value) in params {
            match self.params.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = *value,
                None => self.params.push((key.clone(), *value)),
            }
        }
        for handle in self.generators.values() {
            handle.send(ControlMessage::SetParams(params.to_vec()))?;
        }
        Ok(())
    }

    /// Set target gains of producers and the master.
    ///
    /// Every bus applies the names it mixes and ignores the rest.
    pub fn set_gain(&mut self, update: GainUpdate) -> Result<()> {
        for (name, gain) in &update.inputs {
            self.input_gains.insert(name.clone(), *gain);
        }
        if update.master.is_some() {
            self.master_gain = update.master;
        }
        for handle in self.generators.values() {
            handle.send(ControlMessage::SetGain(update.clone()))?;
        }
        self.send_render(RenderControl::SetGain(update))
    }

    /// Handle everything the tasks and the render callback reported.
    ///
    /// Returns the number of events processed.
    pub fn poll(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.task_events.try_recv() {
            count += 1;
            self.on_task_event(event);
        }
        while let Ok(event) = self.render_events.try_recv() {
            count += 1;
            self.on_render_event(event);
        }
        count
    }

    /// Output bus levels from the render callback's meters.
    pub fn levels(&self) -> Vec<LevelReading> {
        self.output_names
            .iter()
            .enumerate()
            .map(|(slot, name)| LevelReading {
                name: name.clone(),
                volume: self.meters.input(slot),
            })
            .collect()
    }

    pub fn master_level(&self) -> f32 {
        self.meters.master()
    }

    /// Output bus underruns since the session was created.
    pub fn underruns(&self) -> u64 {
        self.meters.underruns()
    }

    fn sync_generators(&mut self, structure: &ScoreStructure) -> Result<()> {
        let wanted: BTreeSet<&str> = structure.tasks().into_iter().map(|t| t.name.as_str()).collect();

        let stale: Vec<String> = self
            .generators
            .keys()
            .filter(|name| !wanted.contains(name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            if let Some(handle) = self.generators.remove(&name) {
                log::debug!("[SESSION] shutting down {}", name);
                handle.shutdown();
            }
        }

        for name in wanted {
            let respawn = self.generators.get(name).map_or(true, |h| h.is_finished());
            if respawn {
                let handle = generator::spawn(name, &self.config, self.task_events_tx.clone())?;
                self.generators.insert(name.to_string(), handle);
            }
        }
        Ok(())
    }

    fn gain_update(&self) -> GainUpdate {
        let update = self
            .input_gains
            .iter()
            .fold(GainUpdate::new(), |update, (name, gain)| update.with_input(name, *gain));
        match self.master_gain {
            Some(master) => update.with_master(master),
            None => update,
        }
    }

    fn send_render(&self, message: RenderControl) -> Result<()> {
        self.render_control
            .try_send(message)
            .map_err(|e| DittyError::Channel(format!("render control: {}", e)))
    }

    fn on_task_event(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::Note(note) => {
                log::trace!("[SESSION] {} played {} at {}", note.loop_name, note.note, note.tick);
                self.dispatch(SessionEvent::Note(note));
            }
            TaskEvent::Update(update) => {
                log_debug_batch(&update.source, &update.debug);
                self.follow_tempo(update.transport.bpm);
                self.dispatch(SessionEvent::Update(update));
            }
            TaskEvent::Error(report) => {
                log::error!("[SESSION] {} failed: {}", report.source, report.error);
                // the task already left its loop; dropping the handle joins it
                self.generators.remove(&report.source);
                if let Err(e) = self.stop() {
                    log::error!("[SESSION] stop after failure: {}", e);
                }
                self.dispatch(SessionEvent::Error {
                    source: report.source,
                    message: report.error.to_string(),
                });
            }
        }
    }

    fn follow_tempo(&mut self, bpm: f64) {
        if self.stopped || bpm == self.render_bpm {
            return;
        }
        match self.send_render(RenderControl::SetBpm(bpm)) {
            Ok(()) => {
                log::debug!("[SESSION] tempo changed to {} bpm", bpm);
                self.render_bpm = bpm;
            }
            Err(e) => log::debug!("[SESSION] tempo change not forwarded: {}", e),
        }
    }

    fn on_render_event(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::Update { tick, time, bpm } => {
                self.dispatch(SessionEvent::Transport { tick, time, bpm });
            }
            RenderEvent::Underrun { input } => {
                let name = self
                    .output_names
                    .get(input)
                    .cloned()
                    .unwrap_or_else(|| format!("input {}", input));
                if self.host.realtime() {
                    log::warn!("[BUS] output: {} can't keep up", name);
                } else {
                    log::debug!("[BUS] output: {} can't keep up", name);
                }
                self.dispatch(SessionEvent::Underrun { input: name });
            }
            RenderEvent::Retired(bus) => {
                log::trace!("[RENDER] retired a bus of {} input(s)", bus.len());
            }
        }
    }

    fn dispatch(&mut self, event: SessionEvent) {
        self.subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

impl<H: AudioHost> Drop for Session<H> {
    fn drop(&mut self) {
        let _ = self.host.suspend();
        for (_, handle) in std::mem::take(&mut self.generators) {
            handle.shutdown();
        }
    }
}

fn log_debug_batch(source: &str, batch: &DebugBatch) {
    for message in &batch.messages {
        match message.level {
            DebugLevel::Error | DebugLevel::Warn => {
                log::warn!("[{}] {}: {}", source, message.label, message.message)
            }
            DebugLevel::Log => log::debug!("[{}] {}: {}", source, message.label, message.message),
        }
    }
    for probe in &batch.probes {
        log::trace!("[{}] probe {}: {} sample(s)", source, probe.label, probe.samples);
    }
}

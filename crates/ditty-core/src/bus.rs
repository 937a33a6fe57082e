//! Buffer pool and audio bus.
//!
//! Producers render into a fixed set of [`Buffer`]s and hand them over through
//! a bounded channel pair: buffers travel downstream through the publish side
//! and come back through the recycle side once the consumer is done with them.
//!
//! An [`AudioBus`] collects the buffers of all its inputs and mixes those whose
//! sequence index matches its own counter. The counter is the only ordering
//! between producers; arrival order does not matter. The bus refuses to mix
//! until every input has queued more than `lookahead` buffers, and drops back
//! into that waiting state whenever an input misses its buffer (an underrun).
//!
//! A bus is owned by exactly one task. Nothing in it is shared.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};

use crate::config::EngineConfig;
use crate::error::{DittyError, Result};

/// One block of interleaved stereo samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    /// Sequence index assigned by the producer when it renders the buffer.
    pub index: u64,
    pub data: Vec<f32>,
}

impl Buffer {
    /// A silent buffer of `frames` stereo frames.
    pub fn new(frames: usize) -> Self {
        Self {
            index: 0,
            data: vec![0.0; frames * 2],
        }
    }

    pub fn frames(&self) -> usize {
        self.data.len() / 2
    }
}

/// Allocate the buffers a producer owns.
pub fn allocate_buffers(config: &EngineConfig) -> Vec<Buffer> {
    (0..config.num_buffers)
        .map(|i| {
            let mut buffer = Buffer::new(config.buffer_length);
            buffer.index = i as u64;
            buffer
        })
        .collect()
}

/// Producer side of a link.
#[derive(Debug)]
pub struct OutputPort {
    publish: Sender<Buffer>,
    recycled: Receiver<Buffer>,
}

impl OutputPort {
    /// Hand a rendered buffer to the consumer.
    pub fn send(&self, buffer: Buffer) -> Result<()> {
        self.publish
            .try_send(buffer)
            .map_err(|e| DittyError::Channel(format!("buffer publish failed: {}", e)))
    }

    /// Buffers returned by the consumer.
    pub fn recycled(&self) -> &Receiver<Buffer> {
        &self.recycled
    }
}

/// Consumer side of a link.
#[derive(Debug)]
pub struct InputPort {
    name: String,
    deliveries: Receiver<Buffer>,
    recycle: Sender<Buffer>,
}

impl InputPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deliveries(&self) -> &Receiver<Buffer> {
        &self.deliveries
    }

    /// Return a buffer to its producer. Dropped if the producer is gone.
    pub fn recycle(&self, buffer: Buffer) -> bool {
        self.recycle.try_send(buffer).is_ok()
    }
}

/// Create a producer/consumer link for the producer `name`.
///
/// Both directions are bounded by the number of buffers in flight.
pub fn buffer_link(name: &str, capacity: usize) -> (OutputPort, InputPort) {
    let (publish, deliveries) = bounded(capacity);
    let (recycle, recycled) = bounded(capacity);
    (
        OutputPort { publish, recycled },
        InputPort {
            name: name.to_string(),
            deliveries,
            recycle,
        },
    )
}

/// Gain that approaches its target exponentially, one step per sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedGain {
    current: f32,
    target: f32,
    rate: f32,
}

impl SmoothedGain {
    /// Starts silent and fades in towards 1.
    pub fn new(rate: f32) -> Self {
        Self {
            current: 0.0,
            target: 1.0,
            rate,
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target;
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    pub fn current(&self) -> f32 {
        self.current
    }

    pub fn step(&mut self) -> f32 {
        self.current += (self.target - self.current) * self.rate;
        self.current
    }
}

/// Fast-attack, slow-decay level estimate, updated once per buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelMeter {
    sum_squares: f32,
    volume: f32,
    window: f32,
}

impl LevelMeter {
    pub fn new(window: f32) -> Self {
        Self {
            sum_squares: 0.0,
            volume: 0.0,
            window,
        }
    }

    pub fn accumulate(&mut self, left: f32, right: f32) {
        self.sum_squares += left * left + right * right;
    }

    /// Fold the accumulated energy into the level and reset the accumulator.
    pub fn finish(&mut self) {
        self.volume = (0.9 * self.volume).max((self.sum_squares / self.window).sqrt());
        self.sum_squares = 0.0;
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }
}

/// Target gains for named bus inputs and the master.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GainUpdate {
    pub inputs: Vec<(String, f32)>,
    pub master: Option<f32>,
}

impl GainUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, name: &str, gain: f32) -> Self {
        self.inputs.push((name.to_string(), gain));
        self
    }

    pub fn with_master(mut self, gain: f32) -> Self {
        self.master = Some(gain);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.master.is_none()
    }
}

#[derive(Debug)]
struct BusInput {
    port: InputPort,
    queue: Vec<Buffer>,
    active: Option<usize>,
    gain: SmoothedGain,
    meter: LevelMeter,
}

#[derive(Debug)]
struct Master {
    gain: SmoothedGain,
    meter: LevelMeter,
    headroom: f32,
}

/// Mixing and synchronization point for several producers.
#[derive(Debug, Default)]
pub struct AudioBus {
    inputs: Vec<BusInput>,
    master: Option<Master>,
    counter: u64,
    started: bool,
    lookahead: usize,
    underruns: u64,
    pending_underrun: Option<usize>,
    disconnected: bool,
}

impl AudioBus {
    /// A bus over `ports`. The master stage is used by the final output bus.
    pub fn new(ports: Vec<InputPort>, config: &EngineConfig, master: bool) -> Self {
        let inputs = ports
            .into_iter()
            .map(|port| BusInput {
                port,
                queue: Vec::with_capacity(config.num_buffers + 1),
                active: None,
                gain: SmoothedGain::new(config.gain_smoothing),
                meter: LevelMeter::new(config.level_window),
            })
            .collect();
        Self {
            inputs,
            master: master.then(|| Master {
                gain: SmoothedGain::new(config.gain_smoothing),
                meter: LevelMeter::new(config.level_window),
                headroom: config.master_headroom,
            }),
            counter: 0,
            started: false,
            lookahead: config.lookahead,
            underruns: 0,
            pending_underrun: None,
            disconnected: false,
        }
    }

    /// A bus without inputs. Never allocates.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Index of the next buffer to mix.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Underruns seen since the bus was created.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Input that caused the most recent unreported underrun.
    pub fn take_underrun(&mut self) -> Option<usize> {
        self.pending_underrun.take()
    }

    /// Whether a producer dropped its end of the link.
    pub fn disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn input_name(&self, input: usize) -> Option<&str> {
        self.inputs.get(input).map(|i| i.port.name())
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|i| i.port.name())
    }

    /// Delivery receivers, in input order.
    pub fn receivers(&self) -> impl Iterator<Item = &Receiver<Buffer>> {
        self.inputs.iter().map(|i| i.port.deliveries())
    }

    /// Queue a delivered buffer on `input`.
    pub fn deliver(&mut self, input: usize, buffer: Buffer) {
        if let Some(entry) = self.inputs.get_mut(input) {
            entry.queue.push(buffer);
        }
        self.check_started();
    }

    /// Drain every input's delivery channel. Returns the number of buffers received.
    pub fn receive(&mut self) -> usize {
        let mut received = 0;
        for input in &mut self.inputs {
            loop {
                match input.port.deliveries().try_recv() {
                    Ok(buffer) => {
                        input.queue.push(buffer);
                        received += 1;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.disconnected = true;
                        break;
                    }
                }
            }
        }
        if received > 0 {
            self.check_started();
        }
        received
    }

    fn check_started(&mut self) {
        if !self.started {
            let lookahead = self.lookahead;
            self.started = self.inputs.iter().all(|i| i.queue.len() > lookahead);
        }
    }

    /// Whether the buffers for the current counter are all present.
    ///
    /// Recycles stale buffers as a side effect. A missing buffer is an
    /// underrun: the bus stops until the lookahead has been rebuilt.
    pub fn data_available(&mut self) -> bool {
        if !self.started {
            return false;
        }

        let counter = self.counter;
        for (i, input) in self.inputs.iter_mut().enumerate() {
            while let Some(pos) = input.queue.iter().position(|b| b.index < counter) {
                let stale = input.queue.swap_remove(pos);
                input.port.recycle(stale);
            }
            input.active = input.queue.iter().position(|b| b.index == counter);

            if input.active.is_none() {
                self.started = false;
                self.underruns += 1;
                self.pending_underrun = Some(i);
                return false;
            }
        }
        true
    }

    /// Mix the current buffers into `out` (interleaved stereo).
    ///
    /// Returns false and leaves `out` untouched when the data is not available.
    pub fn mix(&mut self, out: &mut [f32]) -> bool {
        if !self.data_available() {
            return false;
        }

        for (frame, sample) in out.chunks_exact_mut(2).enumerate() {
            let mut value = [0.0f32, 0.0f32];
            for input in &mut self.inputs {
                let gain = input.gain.step();
                let (left, right) = match input.active.map(|a| &input.queue[a].data) {
                    Some(data) if data.len() > frame * 2 + 1 => {
                        (data[frame * 2] * gain, data[frame * 2 + 1] * gain)
                    }
                    _ => (0.0, 0.0),
                };
                input.meter.accumulate(left, right);
                value[0] += left;
                value[1] += right;
            }

            match &mut self.master {
                Some(master) => {
                    let gain = master.gain.step();
                    let (left, right) = (value[0] * gain, value[1] * gain);
                    master.meter.accumulate(left, right);
                    sample[0] = master.headroom * left;
                    sample[1] = master.headroom * right;
                }
                None => {
                    sample[0] = value[0];
                    sample[1] = value[1];
                }
            }
        }

        for input in &mut self.inputs {
            input.meter.finish();
        }
        if let Some(master) = &mut self.master {
            master.meter.finish();
        }
        self.counter += 1;
        true
    }

    /// Receive pending deliveries and mix, or write silence.
    pub fn pull(&mut self, out: &mut [f32]) -> bool {
        self.receive();
        if self.mix(out) {
            true
        } else {
            out.fill(0.0);
            false
        }
    }

    /// Apply target gains. Names that are not inputs of this bus are ignored.
    pub fn set_gain(&mut self, update: &GainUpdate) {
        for (name, gain) in &update.inputs {
            if let Some(input) = self.inputs.iter_mut().find(|i| i.port.name() == name) {
                input.gain.set_target(*gain);
            }
        }
        if let (Some(master), Some(gain)) = (&mut self.master, update.master) {
            master.gain.set_target(gain);
        }
    }

    /// Level of each input, in input order.
    pub fn levels(&self) -> impl Iterator<Item = (&str, f32)> {
        self.inputs.iter().map(|i| (i.port.name(), i.meter.volume()))
    }

    pub fn master_level(&self) -> Option<f32> {
        self.master.as_ref().map(|m| m.meter.volume())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        EngineConfig::default().with_buffer_length(8)
    }

    /// Producer stand-in owning its buffers.
    struct Producer {
        port: OutputPort,
        next: u64,
        free: Vec<Buffer>,
        value: f32,
    }

    impl Producer {
        fn new(port: OutputPort, config: &EngineConfig, value: f32) -> Self {
            Self {
                port,
                next: 0,
                free: (0..config.num_buffers).map(|_| Buffer::new(config.buffer_length)).collect(),
                value,
            }
        }

        fn deliver(&mut self, count: usize) {
            for _ in 0..count {
                if let Some(mut buffer) = self.free.pop() {
                    buffer.index = self.next;
                    buffer.data.fill(self.value);
                    self.next += 1;
                    self.port.send(buffer).unwrap();
                }
            }
        }

        fn collect(&mut self) {
            while let Ok(buffer) = self.port.recycled().try_recv() {
                self.free.push(buffer);
            }
        }
    }

    fn setup(values: &[f32]) -> (AudioBus, Vec<Producer>) {
        let config = config();
        let mut ports = Vec::new();
        let mut producers = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let (output, input) = buffer_link(&format!("p{}", i), config.num_buffers);
            ports.push(input);
            producers.push(Producer::new(output, &config, *value));
        }
        (AudioBus::new(ports, &config, false), producers)
    }

    #[test]
    fn test_waits_for_lookahead() {
        let (mut bus, mut producers) = setup(&[1.0, 1.0]);
        producers[0].deliver(4);
        producers[1].deliver(1);
        bus.receive();
        assert!(!bus.data_available());
        let mut out = vec![7.0; 16];
        assert!(!bus.pull(&mut out));
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(bus.counter(), 0);
        assert_eq!(bus.underruns(), 0);

        producers[1].deliver(3);
        bus.receive();
        assert!(bus.started());
        assert!(bus.data_available());
    }

    #[test]
    fn test_steady_state_has_no_underruns() {
        let (mut bus, mut producers) = setup(&[0.5, 0.25, 0.125]);
        for p in &mut producers {
            p.deliver(4);
        }
        let mut out = vec![0.0; 16];
        for _ in 0..=20 {
            assert!(bus.pull(&mut out));
            for p in &mut producers {
                p.collect();
                p.deliver(4);
            }
        }
        assert_eq!(bus.underruns(), 0);
        assert_eq!(bus.counter(), 21);
    }

    #[test]
    fn test_underrun_recovers() {
        let (mut bus, mut producers) = setup(&[1.0, 1.0]);
        for p in &mut producers {
            p.deliver(4);
        }
        let mut out = vec![0.0; 16];
        for _ in 0..4 {
            assert!(bus.pull(&mut out));
            producers[0].collect();
            producers[0].deliver(4);
            // producer 1 stalls
            producers[1].collect();
        }

        assert!(!bus.pull(&mut out));
        assert_eq!(bus.underruns(), 1);
        assert_eq!(bus.take_underrun(), Some(1));
        assert_eq!(bus.take_underrun(), None);
        assert!(out.iter().all(|s| *s == 0.0));

        // waiting for lookahead is not another underrun
        assert!(!bus.pull(&mut out));
        assert_eq!(bus.underruns(), 1);

        for p in &mut producers {
            p.collect();
            p.deliver(4);
        }
        assert!(bus.pull(&mut out));
        assert_eq!(bus.counter(), 5);
        assert_eq!(bus.underruns(), 1);
    }

    #[test]
    fn test_gain_smoothing_converges_without_overshoot() {
        let mut gain = SmoothedGain::new(0.001);
        let mut last = gain.current();
        for _ in 0..20_000 {
            let value = gain.step();
            assert!(value >= last && value <= 1.0);
            last = value;
        }
        assert!((1.0 - last).abs() < 1e-3);

        gain.set_target(0.25);
        for _ in 0..20_000 {
            let value = gain.step();
            assert!(value <= last && value >= 0.25);
            last = value;
        }
    }

    #[test]
    fn test_master_headroom_and_gain_targets() {
        let config = config().with_gain_smoothing(1.0);
        let (output, input) = buffer_link("lead", config.num_buffers);
        let mut producer = Producer::new(output, &config, 0.5);
        let mut bus = AudioBus::new(vec![input], &config, true);
        bus.set_gain(&GainUpdate::new().with_input("lead", 0.5).with_master(1.0));
        producer.deliver(4);
        let mut out = vec![0.0; 16];
        assert!(bus.pull(&mut out));
        // 0.5 * 0.5 gain * 0.5 headroom
        assert!(out.iter().all(|s| (*s - 0.125).abs() < 1e-6));
        assert!(bus.master_level().unwrap() > 0.0);
        let levels: Vec<_> = bus.levels().collect();
        assert_eq!(levels[0].0, "lead");
        assert!(levels[0].1 > 0.0);
    }

    #[test]
    fn test_buffers_arrive_out_of_order() {
        let config = config();
        let (output, input) = buffer_link("a", config.num_buffers);
        let mut bus = AudioBus::new(vec![input], &config, false);
        for index in [2u64, 0, 3, 1] {
            let mut buffer = Buffer::new(config.buffer_length);
            buffer.index = index;
            buffer.data.fill(index as f32);
            output.send(buffer).unwrap();
        }
        let mut out = vec![0.0; 16];
        assert!(bus.pull(&mut out));
        assert!(bus.pull(&mut out));
        assert_eq!(bus.counter(), 2);
        // buffer 0 came back on the second pull
        assert_eq!(output.recycled().try_recv().map(|b| b.index), Ok(0));
    }
}

//! Generator tasks.
//!
//! Every loop and every shared filter renders on its own thread. A task is
//! idle until it receives an `Init`; it then evaluates the score in its own
//! engine, builds its node and renders into the buffers it was handed.
//! Rendering is pull driven: a buffer is rendered whenever one is free and,
//! for shared filters, the input bus has data for it. Free buffers come back
//! through the recycle channel of the output port.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError};

use crate::api::CompiledScore;
use crate::bus::{AudioBus, Buffer, OutputPort};
use crate::config::EngineConfig;
use crate::context::ContextHandle;
use crate::error::{DittyError, Result};
use crate::filter::FilterNode;
use crate::messages::{ControlMessage, ErrorReport, InitPayload, LevelReading, PeriodicUpdate, TaskEvent};
use crate::scheduler::LiveLoop;
use crate::synth::Frame;
use crate::topology::{NodeKind, TopologyEntry};

const CONTROL_CAPACITY: usize = 64;

/// Handle to a running generator task.
pub struct GeneratorHandle {
    name: String,
    control: Sender<ControlMessage>,
    thread: Option<JoinHandle<()>>,
}

impl GeneratorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.control
            .send(message)
            .map_err(|_| DittyError::Channel(format!("generator task {} is gone", self.name)))
    }

    /// Whether the task thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the task to exit and wait for it.
    pub fn shutdown(mut self) {
        let _ = self.control.send(ControlMessage::Shutdown);
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("[TASK] {} panicked", self.name);
            }
        }
    }
}

impl Drop for GeneratorHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.control.send(ControlMessage::Shutdown);
            self.join();
        }
    }
}

/// Spawn an idle generator task.
pub fn spawn(name: &str, config: &EngineConfig, events: Sender<TaskEvent>) -> Result<GeneratorHandle> {
    let (control, control_rx) = bounded(CONTROL_CAPACITY);
    let task = GeneratorTask {
        name: name.to_string(),
        config: config.clone(),
        control: control_rx,
        events,
        active: None,
    };
    let thread = thread::Builder::new()
        .name(format!("ditty-{}", name))
        .spawn(move || task.run())?;
    log::debug!("[TASK] spawned {}", name);
    Ok(GeneratorHandle {
        name: name.to_string(),
        control,
        thread: Some(thread),
    })
}

enum Node {
    Loop(LiveLoop),
    Filter(FilterNode),
}

impl Node {
    fn render(&mut self, input: Frame) -> Result<Frame> {
        match self {
            Node::Loop(live) => live.process(),
            Node::Filter(filter) => filter.process(input),
        }
    }
}

/// A task that received its `Init`.
struct Active {
    entry: TopologyEntry,
    // keeps the engine behind the node's script callbacks alive
    _compiled: CompiledScore,
    ctx: ContextHandle,
    node: Node,
    output: OutputPort,
    free: Vec<Buffer>,
    bus: AudioBus,
    counter: u64,
    // tempo in the last update, so score tempo changes reach the session
    reported_bpm: f64,
}

enum Wake {
    Control,
    Data,
}

struct GeneratorTask {
    name: String,
    config: EngineConfig,
    control: Receiver<ControlMessage>,
    events: Sender<TaskEvent>,
    active: Option<Active>,
}

impl GeneratorTask {
    fn run(mut self) {
        loop {
            match self.wait() {
                Wake::Control => match self.control.try_recv() {
                    Ok(ControlMessage::Shutdown) | Err(TryRecvError::Disconnected) => break,
                    Ok(message) => {
                        if let Err(error) = self.handle(message) {
                            self.fail(error);
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => {}
                },
                Wake::Data => {
                    if let Err(error) = self.pump() {
                        self.fail(error);
                        break;
                    }
                }
            }
        }
        log::debug!("[TASK] {} exiting", self.name);
    }

    /// Block until a control message or buffer traffic arrives.
    fn wait(&self) -> Wake {
        let Some(active) = &self.active else {
            let mut select = Select::new();
            select.recv(&self.control);
            select.ready();
            return Wake::Control;
        };

        let mut select = Select::new();
        let control = select.recv(&self.control);
        select.recv(active.output.recycled());
        for receiver in active.bus.receivers() {
            select.recv(receiver);
        }
        if select.ready() == control {
            Wake::Control
        } else {
            Wake::Data
        }
    }

    fn handle(&mut self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::Init(payload) => {
                self.active = None;
                let active = self.init(*payload)?;
                log::info!("[TASK] {} rendering {}", self.name, active.entry.kind);
                self.active = Some(active);
                self.fill_buffers()
            }
            ControlMessage::Reset => {
                if self.active.take().is_some() {
                    log::debug!("[TASK] {} reset", self.name);
                }
                Ok(())
            }
            ControlMessage::SetParams(params) => {
                if let Some(active) = &self.active {
                    active.ctx.set_inputs(&params);
                }
                Ok(())
            }
            ControlMessage::SetGain(update) => {
                if let Some(active) = &mut self.active {
                    active.bus.set_gain(&update);
                }
                Ok(())
            }
            // handled by the run loop
            ControlMessage::Shutdown => Ok(()),
        }
    }

    fn init(&self, payload: InitPayload) -> Result<Active> {
        let InitPayload {
            entry,
            code,
            params,
            gains,
            output,
            buffers,
            inputs,
        } = payload;

        let ctx = ContextHandle::new(self.config.bpm, self.config.sample_rate)?;
        ctx.set_inputs(&params);
        let compiled = CompiledScore::evaluate(&code, &ctx)?;
        let node = match entry.kind {
            NodeKind::Loop => Node::Loop(compiled.build_loop(&entry.name)?),
            NodeKind::SharedFilter => Node::Filter(compiled.build_shared_filter(&entry.name)?),
            other => {
                return Err(DittyError::Config(format!(
                    "{} can't run as a task ({})",
                    entry.name, other
                )))
            }
        };

        let mut bus = if inputs.is_empty() {
            AudioBus::empty()
        } else {
            AudioBus::new(inputs, &self.config, false)
        };
        bus.set_gain(&gains);

        let reported_bpm = ctx.bpm();
        Ok(Active {
            entry,
            _compiled: compiled,
            ctx,
            node,
            output,
            free: buffers,
            bus,
            counter: 0,
            reported_bpm,
        })
    }

    /// Take back recycled buffers and incoming deliveries, then render.
    fn pump(&mut self) -> Result<()> {
        let Some(active) = &mut self.active else {
            return Ok(());
        };

        loop {
            match active.output.recycled().try_recv() {
                Ok(buffer) => active.free.push(buffer),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::debug!("[TASK] {} consumer went away, going idle", self.name);
                    self.active = None;
                    return Ok(());
                }
            }
        }
        active.bus.receive();
        if active.bus.disconnected() {
            log::debug!("[TASK] {} lost an input, going idle", self.name);
            self.active = None;
            return Ok(());
        }
        self.fill_buffers()
    }

    /// Render into every free buffer while input data is available.
    fn fill_buffers(&mut self) -> Result<()> {
        let Some(active) = &mut self.active else {
            return Ok(());
        };

        while let Some(mut buffer) = active.free.pop() {
            let has_inputs = !active.bus.is_empty();
            if has_inputs && !active.bus.mix(&mut buffer.data) {
                active.free.push(buffer);
                if let Some(input) = active.bus.take_underrun() {
                    let name = active.bus.input_name(input).unwrap_or("input").to_string();
                    log::debug!("[BUS] {}: {} can't keep up", self.name, name);
                    active
                        .ctx
                        .debug(|d| d.error("Performance error", &format!("{} can't keep up.", name)));
                }
                break;
            }

            buffer.index = active.counter;
            active.counter += 1;
            for sample in buffer.data.chunks_exact_mut(2) {
                let frame = active.node.render([sample[0] as f64, sample[1] as f64])?;
                sample[0] = frame[0] as f32;
                sample[1] = frame[1] as f32;
                active.ctx.advance();
            }

            if let Err(e) = active.output.send(buffer) {
                log::debug!("[TASK] {} {}, going idle", self.name, e);
                self.active = None;
                return Ok(());
            }
            active.report(&self.name, &self.events);
        }
        Ok(())
    }

    fn fail(&mut self, error: DittyError) {
        log::error!("[TASK] {} failed: {}", self.name, error);
        self.active = None;
        let _ = self.events.send(TaskEvent::Error(ErrorReport {
            source: self.name.clone(),
            error,
        }));
    }
}

impl Active {
    /// Send the notes played and telemetry collected since the last buffer.
    fn report(&mut self, name: &str, events: &Sender<TaskEvent>) {
        for note in self.ctx.take_notes() {
            let _ = events.send(TaskEvent::Note(note));
        }
        let debug = self.ctx.take_debug();
        let transport = self.ctx.snapshot();
        let tempo_changed = transport.bpm != self.reported_bpm;
        if debug.is_empty() && self.bus.is_empty() && !tempo_changed {
            return;
        }
        self.reported_bpm = transport.bpm;
        let levels = self
            .bus
            .levels()
            .map(|(name, volume)| LevelReading {
                name: name.to_string(),
                volume,
            })
            .collect();
        let _ = events.send(TaskEvent::Update(PeriodicUpdate {
            source: name.to_string(),
            transport,
            levels,
            debug,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::analyze;
    use crate::bus::{allocate_buffers, buffer_link, GainUpdate};
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig::default().with_buffer_length(64)
    }

    fn init(code: &str, name: &str, config: &EngineConfig) -> (InitPayload, crate::bus::InputPort) {
        let structure = analyze(code, config).unwrap();
        let entry = structure.find(name).unwrap().clone();
        let (output, input) = buffer_link(name, config.num_buffers);
        let payload = InitPayload {
            entry,
            code: code.to_string(),
            params: Vec::new(),
            gains: GainUpdate::new(),
            output,
            buffers: allocate_buffers(config),
            inputs: Vec::new(),
        };
        (payload, input)
    }

    #[test]
    fn test_loop_task_renders_in_order() {
        let config = config();
        let code = r#"live_loop(|c, o| { sine.play(a4, #{ duration: 4 }); sleep(4); }, #{ name: "lead" });"#;
        let (events, events_rx) = unbounded();
        let task = spawn("lead", &config, events).unwrap();
        let (payload, input) = init(code, "lead", &config);
        task.send(ControlMessage::Init(Box::new(payload))).unwrap();

        let mut indices = Vec::new();
        let mut heard = false;
        for _ in 0..12 {
            let buffer = input.deliveries().recv_timeout(Duration::from_secs(5)).unwrap();
            indices.push(buffer.index);
            heard |= buffer.data.iter().any(|&s| s != 0.0);
            assert!(input.recycle(buffer));
        }
        assert_eq!(indices, (0..12).collect::<Vec<u64>>());
        assert!(heard);

        let note = events_rx
            .iter()
            .find_map(|e| match e {
                TaskEvent::Note(note) => Some(note),
                _ => None,
            })
            .unwrap();
        assert_eq!(note.loop_name, "lead");
        assert_eq!(note.note, 69.0);
        task.shutdown();
    }

    #[test]
    fn test_task_waits_for_recycled_buffers() {
        let config = config();
        let code = r#"live_loop(|c, o| { sleep(1); }, #{ name: "lead" });"#;
        let (events, _events_rx) = unbounded();
        let task = spawn("lead", &config, events).unwrap();
        let (payload, input) = init(code, "lead", &config);
        task.send(ControlMessage::Init(Box::new(payload))).unwrap();

        for _ in 0..config.num_buffers {
            input.deliveries().recv_timeout(Duration::from_secs(5)).unwrap();
        }
        // every buffer is out, so nothing else arrives
        assert!(input.deliveries().recv_timeout(Duration::from_millis(100)).is_err());
        task.shutdown();
    }

    #[test]
    fn test_runtime_error_is_reported() {
        let config = config();
        let code = r#"live_loop(|c, o| { if c > 0 { throw "broken"; } sleep(0.001); }, #{ name: "bad" });"#;
        let (events, events_rx) = unbounded();
        let task = spawn("bad", &config, events).unwrap();
        let (payload, _input) = init(code, "bad", &config);
        task.send(ControlMessage::Init(Box::new(payload))).unwrap();

        let report = events_rx
            .iter()
            .find_map(|e| match e {
                TaskEvent::Error(report) => Some(report),
                _ => None,
            })
            .unwrap();
        assert_eq!(report.source, "bad");
        assert!(matches!(report.error, DittyError::Runtime { .. }));
        // the task tears itself down after reporting
        for _ in 0..100 {
            if task.is_finished() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(task.is_finished());
    }

    #[test]
    fn test_reset_goes_idle() {
        let config = config();
        let code = r#"live_loop(|c, o| { sleep(1); }, #{ name: "lead" });"#;
        let (events, _events_rx) = unbounded();
        let task = spawn("lead", &config, events).unwrap();
        let (payload, input) = init(code, "lead", &config);
        task.send(ControlMessage::Init(Box::new(payload))).unwrap();
        input.deliveries().recv_timeout(Duration::from_secs(5)).unwrap();

        task.send(ControlMessage::Reset).unwrap();
        // a fresh init after the reset works on the same task
        let (payload, input) = init(code, "lead", &config);
        task.send(ControlMessage::Init(Box::new(payload))).unwrap();
        let buffer = input.deliveries().recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(buffer.index, 0);
        assert!(!task.is_finished());
        task.shutdown();
    }
}

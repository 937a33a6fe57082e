//! Messages crossing task boundaries.
//!
//! Tasks share no state. The orchestrator drives them with [`ControlMessage`]s
//! and the render callback with [`RenderControl`]s; they answer with
//! [`TaskEvent`]s and [`RenderEvent`]s. Audio itself moves as buffers through
//! the ports carried by the init payloads.

use crate::bus::{AudioBus, Buffer, GainUpdate, InputPort, OutputPort};
use crate::debug::DebugBatch;
use crate::error::DittyError;
use crate::timing::TransportSnapshot;
use crate::topology::TopologyEntry;

/// Everything a generator task needs to start rendering.
#[derive(Debug)]
pub struct InitPayload {
    /// The node this task renders.
    pub entry: TopologyEntry,
    /// Score source, evaluated in the task's own engine.
    pub code: String,
    pub params: Vec<(String, f64)>,
    pub gains: GainUpdate,
    /// Where rendered buffers go.
    pub output: OutputPort,
    /// The buffers this task owns.
    pub buffers: Vec<Buffer>,
    /// Producers feeding this task, if it is a shared filter.
    pub inputs: Vec<InputPort>,
}

/// Orchestrator to generator task.
#[derive(Debug)]
pub enum ControlMessage {
    Init(Box<InitPayload>),
    /// Drop the current node and go idle.
    Reset,
    SetParams(Vec<(String, f64)>),
    SetGain(GainUpdate),
    /// Leave the task loop and end the thread.
    Shutdown,
}

/// A note started playing.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    pub note: f64,
    pub tick: f64,
    pub loop_name: String,
    pub voice: String,
    /// Envelope duration in ticks.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LevelReading {
    pub name: String,
    pub volume: f32,
}

/// Telemetry sent after each rendered buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicUpdate {
    /// Task that produced the update.
    pub source: String,
    pub transport: TransportSnapshot,
    pub levels: Vec<LevelReading>,
    pub debug: DebugBatch,
}

/// A task failed and stopped.
#[derive(Debug)]
pub struct ErrorReport {
    pub source: String,
    pub error: DittyError,
}

/// Generator task to orchestrator.
#[derive(Debug)]
pub enum TaskEvent {
    Note(NoteEvent),
    Update(PeriodicUpdate),
    Error(ErrorReport),
}

/// Orchestrator to render callback.
#[derive(Debug)]
pub enum RenderControl {
    /// Replace the output bus and restart the render transport.
    Init { bus: Box<AudioBus>, bpm: f64 },
    Reset,
    SetGain(GainUpdate),
    /// The score changed tempo; keeps the reported transport in step.
    SetBpm(f64),
}

/// Render callback to orchestrator. Sent without blocking.
#[derive(Debug)]
pub enum RenderEvent {
    /// Once per macro-buffer.
    Update { tick: f64, time: f64, bpm: f64 },
    /// The output bus missed a buffer from this input.
    Underrun { input: usize },
    /// A bus the callback no longer uses, handed back to be dropped off the audio thread.
    Retired(Box<AudioBus>),
}

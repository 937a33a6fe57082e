//! Explicit per-task context.
//!
//! Every generator task owns exactly one [`TaskContext`]: its transport, the
//! operator recorder used while a loop is filling, the score inputs, the debug
//! log and the note telemetry queue. Components receive a [`ContextHandle`] at
//! construction instead of reading any global state.
//!
//! The handle is only ever locked for short, non-reentrant sections. Nothing
//! holds the lock while user code runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::debug::{DebugBatch, DebugLog};
use crate::error::Result;
use crate::messages::NoteEvent;
use crate::operator::Operator;
use crate::timing::{Transport, TransportSnapshot};

/// State owned by one task.
#[derive(Debug)]
pub struct TaskContext {
    pub transport: Transport,
    recording: Option<Vec<Operator>>,
    inputs: HashMap<String, f64>,
    debug: DebugLog,
    notes: Vec<NoteEvent>,
}

/// Shared handle to a task's context.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    inner: Arc<Mutex<TaskContext>>,
}

impl ContextHandle {
    /// Create a context with a transport at tick 0.
    pub fn new(bpm: f64, sample_rate: u32) -> Result<Self> {
        let transport = Transport::new(bpm, sample_rate)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(TaskContext {
                transport,
                recording: None,
                inputs: HashMap::new(),
                debug: DebugLog::default(),
                notes: Vec::new(),
            })),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TaskContext> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a closure with exclusive access to the context.
    pub fn with<R>(&self, f: impl FnOnce(&mut TaskContext) -> R) -> R {
        f(&mut self.lock())
    }

    // === Transport ===

    pub fn transport(&self) -> Transport {
        self.lock().transport
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        self.lock().transport.snapshot()
    }

    pub fn tick(&self) -> f64 {
        self.lock().transport.tick()
    }

    pub fn time(&self) -> f64 {
        self.lock().transport.time()
    }

    pub fn bpm(&self) -> f64 {
        self.lock().transport.bpm()
    }

    pub fn set_bpm(&self, bpm: f64) -> Result<()> {
        self.lock().transport.set_bpm(bpm)
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().transport.sample_rate()
    }

    pub fn set_tick(&self, tick: f64) {
        self.lock().transport.set_tick(tick);
    }

    /// Move the tick position forward without rendering.
    pub fn sleep(&self, ticks: f64) {
        let mut cx = self.lock();
        let tick = cx.transport.tick() + ticks;
        cx.transport.set_tick(tick);
    }

    /// Advance by one rendered sample.
    pub fn advance(&self) {
        self.lock().transport.advance();
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> f64 {
        self.lock().transport.seconds_to_ticks(seconds)
    }

    pub fn ticks_to_seconds(&self, ticks: f64) -> f64 {
        self.lock().transport.ticks_to_seconds(ticks)
    }

    // === Operator recording ===

    /// Start recording operators. Returns whatever recording was in progress.
    pub fn begin_recording(&self) -> Option<Vec<Operator>> {
        self.lock().recording.replace(Vec::new())
    }

    /// Stop recording, restore the previous recorder and return what was captured.
    pub fn end_recording(&self, previous: Option<Vec<Operator>>) -> Vec<Operator> {
        let mut cx = self.lock();
        let captured = cx.recording.take().unwrap_or_default();
        cx.recording = previous;
        captured
    }

    pub fn is_recording(&self) -> bool {
        self.lock().recording.is_some()
    }

    /// Record an operator if a loop is filling. Hands the operator back otherwise.
    pub fn record(&self, operator: Operator) -> std::result::Result<(), Operator> {
        match self.lock().recording.as_mut() {
            Some(operators) => {
                operators.push(operator);
                Ok(())
            }
            None => Err(operator),
        }
    }

    // === Inputs ===

    pub fn input(&self, key: &str) -> Option<f64> {
        self.lock().inputs.get(key).copied()
    }

    pub fn set_input(&self, key: &str, value: f64) {
        self.lock().inputs.insert(key.to_string(), value);
    }

    pub fn set_inputs(&self, values: &[(String, f64)]) {
        let mut cx = self.lock();
        for (key, value) in values {
            cx.inputs.insert(key.clone(), *value);
        }
    }

    // === Telemetry ===

    pub fn debug<R>(&self, f: impl FnOnce(&mut DebugLog) -> R) -> R {
        f(&mut self.lock().debug)
    }

    /// Record a probe value at the current render time.
    pub fn probe(&self, label: &str, value: f64, amp: f64, duration: f64) {
        let mut cx = self.lock();
        let time = cx.transport.time();
        cx.debug.probe(label, value, amp, duration, time);
    }

    pub fn take_debug(&self) -> DebugBatch {
        self.lock().debug.take()
    }

    pub fn push_note(&self, note: NoteEvent) {
        self.lock().notes.push(note);
    }

    pub fn take_notes(&self) -> Vec<NoteEvent> {
        std::mem::take(&mut self.lock().notes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{OptionValue, Options};

    #[test]
    fn test_sleep_moves_tick() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        ctx.sleep(1.5);
        assert!((ctx.tick() - 1.5).abs() < 1e-12);
        ctx.set_tick(0.0);
        assert_eq!(ctx.tick(), 0.0);
    }

    #[test]
    fn test_record_only_while_recording() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let options = Options::new(&ctx, Default::default());
        let op = Operator::ParamChange {
            start_tick: 0.0,
            target: options.clone(),
            key: "amp".to_string(),
            value: OptionValue::Number(0.5),
        };
        assert!(ctx.record(op).is_err());

        let previous = ctx.begin_recording();
        assert!(previous.is_none());
        assert!(ctx.is_recording());
        options.set("amp", OptionValue::Number(0.25));
        let captured = ctx.end_recording(previous);
        assert_eq!(captured.len(), 1);
        assert!(!ctx.is_recording());
    }

    #[test]
    fn test_inputs() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        assert_eq!(ctx.input("cutoff"), None);
        ctx.set_inputs(&[("cutoff".to_string(), 0.3)]);
        assert_eq!(ctx.input("cutoff"), Some(0.3));
    }
}

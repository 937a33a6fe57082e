//! Per-task debug log.
//!
//! Scores report messages and probe values here. The log is shipped with the
//! next periodic update of the owning task and then cleared. Messages are keyed
//! by label, so a message repeated every sample only appears once per batch.

use std::collections::BTreeMap;

use crate::config::BUFFER_LENGTH;

/// Severity of a debug message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    Error,
    Warn,
    Log,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DebugMessage {
    pub level: DebugLevel,
    pub label: String,
    pub message: String,
}

/// Rolling capture of a value over time, one entry per rendered sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub label: String,
    pub amp: f64,
    /// Seconds to display; negative shows everything captured.
    pub duration: f64,
    pub data: Vec<f32>,
    pub samples: usize,
    last_time: f64,
}

/// Messages and probes collected since the last update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugBatch {
    pub messages: Vec<DebugMessage>,
    pub probes: Vec<Probe>,
}

impl DebugBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.probes.is_empty()
    }
}

#[derive(Debug)]
pub struct DebugLog {
    messages: BTreeMap<String, DebugMessage>,
    probes: BTreeMap<String, Probe>,
    probe_length: usize,
}

impl Default for DebugLog {
    fn default() -> Self {
        Self::new(BUFFER_LENGTH)
    }
}

impl DebugLog {
    /// Create a log whose probes hold `probe_length` samples.
    pub fn new(probe_length: usize) -> Self {
        Self {
            messages: BTreeMap::new(),
            probes: BTreeMap::new(),
            probe_length: probe_length.max(1),
        }
    }

    pub fn error(&mut self, label: &str, message: &str) {
        self.insert(DebugLevel::Error, label, message);
    }

    pub fn warn(&mut self, label: &str, message: &str) {
        self.insert(DebugLevel::Warn, label, message);
    }

    pub fn log(&mut self, label: &str, message: &str) {
        self.insert(DebugLevel::Log, label, message);
    }

    fn insert(&mut self, level: DebugLevel, label: &str, message: &str) {
        self.messages.insert(
            label.to_string(),
            DebugMessage {
                level,
                label: label.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Record a probe value. Only the first value per rendered sample is kept.
    pub fn probe(&mut self, label: &str, value: f64, amp: f64, duration: f64, time: f64) {
        let length = self.probe_length;
        let probe = self.probes.entry(label.to_string()).or_insert_with(|| Probe {
            label: label.to_string(),
            amp,
            duration,
            data: vec![0.0; length],
            samples: 0,
            last_time: f64::NAN,
        });
        if probe.last_time != time {
            let slot = probe.samples % probe.data.len();
            probe.data[slot] = value as f32;
            probe.samples += 1;
            probe.last_time = time;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.probes.is_empty()
    }

    /// Take everything collected so far and clear the log.
    pub fn take(&mut self) -> DebugBatch {
        DebugBatch {
            messages: std::mem::take(&mut self.messages).into_values().collect(),
            probes: std::mem::take(&mut self.probes).into_values().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_dedup_by_label() {
        let mut log = DebugLog::new(8);
        log.warn("bass", "has no duration");
        log.warn("bass", "has no duration");
        log.error("Performance error", "lead can't keep up.");
        let batch = log.take();
        assert_eq!(batch.messages.len(), 2);
        assert!(log.is_empty());
    }

    #[test]
    fn test_probe_one_value_per_sample() {
        let mut log = DebugLog::new(4);
        log.probe("lfo", 0.5, 1.0, -1.0, 0.0);
        log.probe("lfo", 0.7, 1.0, -1.0, 0.0);
        log.probe("lfo", 0.9, 1.0, -1.0, 1.0 / 44100.0);
        let batch = log.take();
        let probe = &batch.probes[0];
        assert_eq!(probe.samples, 2);
        assert_eq!(probe.data[0], 0.5);
        assert_eq!(probe.data[1], 0.9);
    }

    #[test]
    fn test_probe_wraps() {
        let mut log = DebugLog::new(2);
        for i in 0..3 {
            log.probe("p", i as f64, 1.0, -1.0, i as f64);
        }
        let batch = log.take();
        assert_eq!(batch.probes[0].data, vec![2.0, 1.0]);
    }
}

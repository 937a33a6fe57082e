//! Recorded, timestamped musical actions.
//!
//! While a loop fills, note triggers and option writes are captured as
//! [`Operator`]s instead of taking effect. The loop sorts them by start tick
//! and applies them during playback once the transport passes that tick.

use std::fmt;

use crate::options::{OptionValue, Options};
use crate::synth::SynthVoice;

/// A recorded scheduling action.
pub enum Operator {
    /// Start a voice.
    NoteOn {
        start_tick: f64,
        voice: Box<SynthVoice>,
    },
    /// Write an option on a live option object.
    ParamChange {
        start_tick: f64,
        target: Options,
        key: String,
        value: OptionValue,
    },
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::NoteOn { start_tick, voice } => f
                .debug_struct("NoteOn")
                .field("start_tick", start_tick)
                .field("synth", &voice.name())
                .finish(),
            Operator::ParamChange {
                start_tick,
                key,
                value,
                ..
            } => f
                .debug_struct("ParamChange")
                .field("start_tick", start_tick)
                .field("key", key)
                .field("value", value)
                .finish(),
        }
    }
}

impl Operator {
    pub fn start_tick(&self) -> f64 {
        match self {
            Operator::NoteOn { start_tick, .. } | Operator::ParamChange { start_tick, .. } => {
                *start_tick
            }
        }
    }
}

/// Sort operators by start tick. Ties keep their recording order.
pub fn sort_operators(operators: &mut [Operator]) {
    // slice::sort_by is stable
    operators.sort_by(|a, b| a.start_tick().total_cmp(&b.start_tick()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextHandle;
    use crate::options::OptionSet;

    fn change(options: &Options, start_tick: f64, value: f64) -> Operator {
        Operator::ParamChange {
            start_tick,
            target: options.clone(),
            key: "amp".to_string(),
            value: OptionValue::Number(value),
        }
    }

    fn value_of(op: &Operator) -> f64 {
        match op {
            Operator::ParamChange {
                value: OptionValue::Number(v),
                ..
            } => *v,
            _ => f64::NAN,
        }
    }

    #[test]
    fn test_sort_is_stable_for_equal_ticks() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let options = Options::new(&ctx, OptionSet::new());
        let mut ops = vec![
            change(&options, 1.0, 0.0),
            change(&options, 0.5, 1.0),
            change(&options, 1.0, 2.0),
            change(&options, 0.5, 3.0),
            change(&options, 1.0, 4.0),
        ];
        sort_operators(&mut ops);
        let order: Vec<f64> = ops.iter().map(value_of).collect();
        assert_eq!(order, vec![1.0, 3.0, 0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_debug_output_names_variant() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let options = Options::new(&ctx, OptionSet::new());
        let text = format!("{:?}", change(&options, 2.0, 0.5));
        assert!(text.starts_with("ParamChange"));
    }
}

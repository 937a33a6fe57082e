//! Ditty Core - the engine behind the ditty live-coding language.
//!
//! This crate provides the building blocks for ditty:
//!
//! - **Timing** - Tick/second conversion and the per-task transport
//! - **Envelopes** - ADSR and breakpoint envelopes evaluated per sample
//! - **Synths and filters** - Voices, option objects and filter chains
//! - **Scheduler** - Live loops that record timed operators and play them back
//! - **Bus** - The buffer pool that synchronizes and mixes concurrent producers
//! - **API** - Rhai scripting API for scores
//! - **Runtime** - Generator tasks, the render callback and the session
//!
//! # Architecture
//!
//! A score is compiled once in a dry run to discover its [`ScoreStructure`].
//! The [`Session`] then starts one generator task per loop and per shared
//! filter. Each task evaluates the score again in its own engine and renders
//! fixed-length buffers tagged with a sequence index. Buses mix buffers with
//! matching indices; the last one feeds the [`RenderCallback`], which the
//! audio host pulls.
//!
//! # Feature Flags
//!
//! - `native` (default) - Audio output and device listing through cpal

pub mod api;
pub mod bounce;
pub mod bus;
pub mod config;
pub mod context;
pub mod debug;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod messages;
pub mod music;
pub mod operator;
pub mod options;
pub mod runtime;
pub mod scheduler;
pub mod score;
pub mod synth;
pub mod timing;
pub mod topology;
pub mod validation;

// Native-only modules (require system dependencies)
#[cfg(feature = "native")]
pub mod audio_device;

pub use api::{analyze, create_engine, register_api, CompiledScore};
pub use bounce::render_to_wav;
pub use bus::{AudioBus, Buffer, GainUpdate};
pub use config::EngineConfig;
pub use context::ContextHandle;
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{DittyError, Result};
pub use messages::{NoteEvent, PeriodicUpdate};
pub use options::{OptionSet, OptionValue, Options};
pub use runtime::{AudioHost, OfflineHost, RenderCallback, Session, SessionEvent};
pub use scheduler::{LiveLoop, LoopState};
pub use synth::SynthDef;
pub use timing::{seconds_to_ticks, ticks_to_seconds, Transport};
pub use topology::{NodeKind, RunAs, ScoreStructure, TopologyEntry};
pub use validation::{validate_score, ValidationError, ValidationResult};

#[cfg(feature = "native")]
pub use audio_device::{list_audio_devices, print_audio_devices, AudioConfig, AudioDeviceInfo, CpalHost};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_round_trip() {
        for bpm in [30.0, 90.0, 120.0, 174.0] {
            for ticks in [0.0, 0.25, 1.0, 7.5, 1024.0] {
                let back = seconds_to_ticks(ticks_to_seconds(ticks, bpm), bpm);
                assert!((back - ticks).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_one_note_per_synced_cycle() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let compiled = CompiledScore::evaluate(
            r#"live_loop(|c, o| { sine.play(c4, #{ duration: 1, env: "one" }); }, #{ name: "lead", "sync": 4 });"#,
            &ctx,
        )
        .unwrap();
        let mut live = compiled.build_loop("lead").unwrap();

        // three full cycles of four ticks
        let samples = (ticks_to_seconds(12.0, 120.0) * 44100.0) as usize;
        for _ in 0..samples {
            live.process().unwrap();
            ctx.advance();
        }
        let notes = ctx.take_notes();
        assert_eq!(notes.len(), 3);
        // a note is reported on the first sample after its tick
        assert!((notes[1].tick - 4.0).abs() < 1e-3);
        assert!((notes[2].tick - 8.0).abs() < 1e-3);
        assert_eq!(live.voice_count(), 0);
    }

    #[test]
    fn test_validate_reexport() {
        let result = validate_score("set_bpm(100);", &EngineConfig::default());
        assert!(result.is_ok());
        assert_eq!(result.structure.unwrap().bpm, 100.0);
    }
}

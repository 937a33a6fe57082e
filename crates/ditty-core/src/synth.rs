//! Synth definitions and voices.
//!
//! A [`SynthDef`] pairs a waveform factory with default options. Playing it
//! inside a filling loop records a `NoteOn` operator carrying a ready-made
//! [`SynthVoice`]; the loop starts the voice once the transport reaches the
//! note's tick and drops it when its envelope runs out.

use std::f64::consts::{FRAC_PI_2, SQRT_2, TAU};
use std::fmt;
use std::sync::{Arc, LazyLock};

use crate::context::ContextHandle;
use crate::envelope::{Envelope, EnvelopeView};
use crate::error::Result;
use crate::music::midi_to_hz;
use crate::operator::Operator;
use crate::options::{OptionSet, Options};
use crate::timing::Transport;

/// One stereo sample.
pub type Frame = [f64; 2];

/// Note played when none is given (c5).
pub const DEFAULT_NOTE: f64 = 72.0;

const PAN_STEPS: usize = 1024;

struct PanTable {
    left: [f64; PAN_STEPS],
    right: [f64; PAN_STEPS],
}

static PAN_TABLE: LazyLock<PanTable> = LazyLock::new(|| {
    let mut table = PanTable {
        left: [0.0; PAN_STEPS],
        right: [0.0; PAN_STEPS],
    };
    for i in 0..PAN_STEPS {
        let angle = FRAC_PI_2 * (1.0 - i as f64 / PAN_STEPS as f64);
        table.left[i] = angle.sin() * SQRT_2;
        table.right[i] = angle.cos() * SQRT_2;
    }
    table
});

/// Apply equal-power panning and gain to a frame.
///
/// Pan is skipped at 0 and gain at 1, so a centered unity voice passes through
/// untouched.
pub fn pan_amp(mut frame: Frame, pan: f64, amp: f64) -> Frame {
    if pan != 0.0 {
        let index = ((pan.clamp(-1.0, 1.0) * 511.0 + 512.0) as i64 & (PAN_STEPS as i64 - 1)) as usize;
        frame[0] *= PAN_TABLE.left[index];
        frame[1] *= PAN_TABLE.right[index];
    }
    if amp != 1.0 {
        frame[0] *= amp;
        frame[1] *= amp;
    }
    frame
}

/// Per-sample input of a waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceInput {
    /// Oscillator phase in cycles, advanced by the note frequency.
    pub phase: f64,
    pub note: f64,
    pub envelope: EnvelopeView,
    /// Ticks since the voice started.
    pub tick: f64,
}

/// Sound source of a voice.
pub trait Waveform: Send {
    fn process(&mut self, input: &VoiceInput, options: &Options) -> Result<Frame>;
}

/// Plain functions produce a mono sample.
impl<F> Waveform for F
where
    F: FnMut(&VoiceInput, &Options) -> Result<f64> + Send,
{
    fn process(&mut self, input: &VoiceInput, options: &Options) -> Result<Frame> {
        let value = self(input, options)?;
        Ok([value, value])
    }
}

/// Creates one waveform per voice from the voice's options.
pub type WaveformFactory = Arc<dyn Fn(&Options) -> Result<Box<dyn Waveform>> + Send + Sync>;

/// A named, playable synth.
#[derive(Clone)]
pub struct SynthDef {
    name: String,
    factory: WaveformFactory,
    defaults: OptionSet,
}

impl fmt::Debug for SynthDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthDef")
            .field("name", &self.name)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl SynthDef {
    pub fn new(name: &str, factory: WaveformFactory, defaults: OptionSet) -> Self {
        let base = OptionSet::new()
            .with("name", name)
            .with("amp", 1.0)
            .with("pan", 0.0);
        Self {
            name: name.to_string(),
            factory,
            defaults: defaults.over(&base),
        }
    }

    /// Definition backed by a stateless function shared by all voices.
    pub fn from_fn<F>(name: &str, waveform: F, defaults: OptionSet) -> Self
    where
        F: Fn(&VoiceInput, &Options) -> Result<f64> + Clone + Send + Sync + 'static,
    {
        let factory: WaveformFactory =
            Arc::new(move |_options: &Options| -> Result<Box<dyn Waveform>> {
                Ok(Box::new(waveform.clone()))
            });
        Self::new(name, factory, defaults)
    }

    /// The built-in sine synth.
    pub fn sine() -> Self {
        Self::from_fn(
            "sine",
            |input: &VoiceInput, _options: &Options| Ok((input.phase * TAU).sin() * input.envelope.value),
            OptionSet::new(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn defaults(&self) -> &OptionSet {
        &self.defaults
    }

    /// Build a voice at the context's current tick.
    pub fn voice(&self, ctx: &ContextHandle, note: f64, options: OptionSet) -> Result<SynthVoice> {
        let base = OptionSet::new()
            .with("amp", 1.0)
            .with("pan", 0.0)
            .with("note", note)
            .with("env", "adsr");
        let options = Options::new(ctx, options.over(&self.defaults.over(&base)));
        let envelope = Envelope::create(&options, &ctx.transport())?;
        let waveform = (self.factory)(&options)?;
        Ok(SynthVoice {
            name: self.name.clone(),
            options,
            envelope,
            waveform,
            phase: 0.0,
        })
    }

    /// Schedule a note at the current tick. Returns the voice's live options.
    pub fn play(&self, ctx: &ContextHandle, note: f64, options: OptionSet) -> Result<Options> {
        self.play_timed(ctx, note, 0.0, options)
    }

    /// Schedule a note `tick_offset` ticks after the current tick.
    pub fn play_timed(
        &self,
        ctx: &ContextHandle,
        note: f64,
        tick_offset: f64,
        options: OptionSet,
    ) -> Result<Options> {
        let now = ctx.tick();
        let start_tick = now + tick_offset;
        ctx.set_tick(start_tick);
        let voice = self.voice(ctx, note, options);
        ctx.set_tick(now);
        let voice = voice?;

        let handle = voice.options().clone();
        let operator = Operator::NoteOn {
            start_tick,
            voice: Box::new(voice),
        };
        if ctx.record(operator).is_err() {
            log::debug!("[LOOP] {} played outside a loop, note dropped", self.name);
            ctx.debug(|d| d.log(&self.name, "notes only play inside a loop"));
        }
        Ok(handle)
    }
}

/// One sounding note.
pub struct SynthVoice {
    name: String,
    options: Options,
    envelope: Envelope,
    waveform: Box<dyn Waveform>,
    phase: f64,
}

impl SynthVoice {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn note(&self) -> Result<f64> {
        self.options.number_or("note", DEFAULT_NOTE)
    }

    /// Envelope duration in ticks.
    pub fn duration(&self) -> Result<f64> {
        self.envelope.duration()
    }

    /// Render one frame. Returns `None` once the envelope is exhausted.
    pub fn process(&mut self, transport: &Transport) -> Result<Option<Frame>> {
        let tick = transport.tick() - self.options.start_tick();
        if !self.envelope.is_active(tick)? {
            return Ok(None);
        }

        let note = self.note()?;
        self.phase += midi_to_hz(note) * transport.dt();
        let input = VoiceInput {
            phase: self.phase,
            note,
            envelope: self.envelope.view(tick, transport)?,
            tick,
        };
        let frame = self.waveform.process(&input, &self.options)?;

        let pan = self.options.number_or("pan", 0.0)?;
        let amp = self.options.number_or("amp", 1.0)?;
        Ok(Some(pan_amp(frame, pan, amp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_amp_passthrough() {
        assert_eq!(pan_amp([0.5, -0.5], 0.0, 1.0), [0.5, -0.5]);
        assert_eq!(pan_amp([0.5, -0.5], 0.0, 0.5), [0.25, -0.25]);
    }

    #[test]
    fn test_pan_hard_left_and_right() {
        let left = pan_amp([1.0, 1.0], -1.0, 1.0);
        assert!(left[0] > 1.4 && left[1] < 0.01);
        let right = pan_amp([1.0, 1.0], 1.0, 1.0);
        assert!(right[1] > 1.4 && right[0] < 0.01);
        // out of range pans are clamped
        assert_eq!(pan_amp([1.0, 1.0], 5.0, 1.0), right);
    }

    #[test]
    fn test_voice_options_layering() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let def = SynthDef::from_fn(
            "square",
            |input: &VoiceInput, _options: &Options| Ok(if input.phase.fract() < 0.5 { 1.0 } else { -1.0 }),
            OptionSet::new().with("amp", 0.5).with("cutoff", 0.3),
        );
        let voice = def.voice(&ctx, 60.0, OptionSet::new().with("cutoff", 0.8)).unwrap();
        let options = voice.options();
        assert_eq!(options.number("amp").unwrap(), Some(0.5));
        assert_eq!(options.number("cutoff").unwrap(), Some(0.8));
        assert_eq!(options.number("note").unwrap(), Some(60.0));
        assert_eq!(options.text("env").as_deref(), Some("adsr"));
        assert_eq!(voice.name(), "square");
    }

    #[test]
    fn test_sine_voice_runs_until_envelope_ends() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let mut voice = SynthDef::sine()
            .voice(&ctx, 69.0, OptionSet::new().with("duration", 0.5).with("release", 0.0))
            .unwrap();
        assert!((voice.duration().unwrap() - 0.5).abs() < 1e-12);

        let mut transport = ctx.transport();
        let mut frames = 0;
        let mut peak: f64 = 0.0;
        while let Some(frame) = voice.process(&transport).unwrap() {
            assert_eq!(frame[0], frame[1]);
            peak = peak.max(frame[0].abs());
            transport.advance();
            frames += 1;
        }
        // half a tick at 120 bpm is 11025 samples
        assert!((11024..=11026).contains(&frames));
        assert!(peak > 0.9);
    }

    #[test]
    fn test_play_outside_loop_is_dropped() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let options = SynthDef::sine().play(&ctx, 60.0, OptionSet::new()).unwrap();
        assert_eq!(options.number("note").unwrap(), Some(60.0));
        assert!(!ctx.take_debug().messages.is_empty());
    }

    #[test]
    fn test_play_timed_records_offset_and_restores_tick() {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        ctx.set_tick(1.0);
        let previous = ctx.begin_recording();
        let options = SynthDef::sine()
            .play_timed(&ctx, 60.0, 0.5, OptionSet::new())
            .unwrap();
        let operators = ctx.end_recording(previous);
        assert_eq!(ctx.tick(), 1.0);
        assert_eq!(options.start_tick(), 1.5);
        assert_eq!(operators.len(), 1);
        assert_eq!(operators[0].start_tick(), 1.5);
    }
}

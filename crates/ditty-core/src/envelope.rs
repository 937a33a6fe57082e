//! Envelope engine.
//!
//! A voice picks its envelope with the `env` option. Segment envelopes walk an
//! ordered list of level breakpoints; each segment either moves linearly or
//! follows an exponential approach towards its target:
//!
//! ```text
//! a1 = (target - value) / (1 - e^curve)
//! a2 = value + a1
//! per sample: a1 *= e^(curve / ceil(count)); value = a2 - a1
//! ```
//!
//! which lands on the target after `count` samples. One segment may be a
//! sustain node: the envelope holds there while the voice's tick is inside its
//! `duration`, then moves on to the release segment.
//!
//! Envelope parameters are read from the voice's own option object; each kind
//! merges its defaults into that object for keys the voice did not set.

use crate::error::Result;
use crate::music::clamp01;
use crate::options::{OptionSet, Options};
use crate::timing::Transport;

/// Duration of the `one` envelope when none is given.
pub const HOLD_FOREVER: f64 = 1e100;

/// Envelope state handed to waveform functions each sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeView {
    pub value: f64,
    /// Elapsed fraction of the duration, clamped to `[0, 1]`.
    pub progress: f64,
    /// Total duration in ticks.
    pub duration: f64,
    pub active: bool,
}

/// Built-in envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Adsr,
    Adsr2,
    Segenv,
    One,
}

impl EnvelopeKind {
    /// Look up a kind by name. Unknown names fall back to `adsr`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "adsr2" => EnvelopeKind::Adsr2,
            "segenv" => EnvelopeKind::Segenv,
            "one" => EnvelopeKind::One,
            _ => EnvelopeKind::Adsr,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EnvelopeKind::Adsr => "adsr",
            EnvelopeKind::Adsr2 => "adsr2",
            EnvelopeKind::Segenv => "segenv",
            EnvelopeKind::One => "one",
        }
    }

    /// Options merged into a voice that uses this kind.
    pub fn defaults(&self) -> OptionSet {
        match self {
            EnvelopeKind::Adsr => OptionSet::new()
                .with("attack", 0.0)
                .with("decay", 0.0)
                .with("duration", 0.0)
                .with("sustain", 1.0)
                .with("release", 0.5)
                .with("curve", -2.0),
            EnvelopeKind::Adsr2 => OptionSet::new()
                .with("attack", 0.0)
                .with("attack_level", 1.0)
                .with("decay", 0.0)
                .with("decay_level", 1.0)
                .with("sustain", 0.0)
                .with("sustain_level", 1.0)
                .with("release", 1.0),
            EnvelopeKind::Segenv => OptionSet::new()
                .with("levels", vec![0.0, 1.0, 0.5, 0.0])
                .with("times", vec![0.1, 0.1, 0.25])
                .with("duration", 0.5)
                .with("curves", vec![0.0, -2.0, -2.0])
                .with("release_node", 2.0),
            EnvelopeKind::One => OptionSet::new().with("duration", HOLD_FOREVER),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Curves {
    PerSegment(Vec<f64>),
    Uniform(f64),
}

impl Curves {
    fn for_segment(&self, index: usize) -> f64 {
        match self {
            Curves::PerSegment(curves) if index > 0 => curves.get(index - 1).copied().unwrap_or(0.0),
            Curves::PerSegment(_) => 0.0,
            Curves::Uniform(curve) => *curve,
        }
    }
}

/// Breakpoints of a segment envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentShape {
    pub levels: Vec<f64>,
    /// Segment lengths in seconds.
    pub times: Vec<f64>,
    /// Sustain hold length in ticks.
    pub duration: f64,
    curves: Curves,
    pub sustain: Option<usize>,
}

impl SegmentShape {
    /// Shape with one curve value per segment.
    pub fn new(levels: Vec<f64>, times: Vec<f64>, duration: f64, curves: Vec<f64>, sustain: Option<usize>) -> Self {
        Self {
            levels,
            times,
            duration,
            curves: Curves::PerSegment(curves),
            sustain,
        }
    }

    /// Shape using the same curve for every segment.
    pub fn with_uniform_curve(levels: Vec<f64>, times: Vec<f64>, duration: f64, curve: f64, sustain: Option<usize>) -> Self {
        Self {
            levels,
            times,
            duration,
            curves: Curves::Uniform(curve),
            sustain,
        }
    }

    fn time(&self, index: usize) -> f64 {
        self.times.get(index).copied().unwrap_or(0.0)
    }
}

/// Breakpoint envelope advanced sample by sample.
#[derive(Debug, Clone)]
pub struct SegmentEnvelope {
    shape: SegmentShape,
    index: usize,
    value: f64,
    start_value: f64,
    target: f64,
    end_tick: f64,
    curve: f64,
    grow: f64,
    a1: f64,
    a2: f64,
    total_duration: f64,
}

impl SegmentEnvelope {
    pub fn new(shape: SegmentShape, transport: &Transport) -> Self {
        let value = shape.levels.first().copied().unwrap_or(0.0);
        let mut envelope = Self {
            shape,
            index: 0,
            value,
            start_value: value,
            target: value,
            end_tick: 0.0,
            curve: 0.0,
            grow: 0.0,
            a1: 0.0,
            a2: 0.0,
            total_duration: 0.0,
        };
        envelope.step(0.0, transport);
        envelope
    }

    /// Set up the segment that starts at `tick`. Returns false once the last
    /// breakpoint has been passed.
    fn step(&mut self, tick: f64, transport: &Transport) -> bool {
        let duration = self.shape.duration;
        let end_tick;

        if Some(self.index) == self.shape.sustain && tick < duration {
            end_tick = duration;
            self.end_tick = duration;
        } else {
            self.index += 1;
            if self.index >= self.shape.levels.len() {
                self.total_duration = 0.0;
                return false;
            }
            end_tick = tick + transport.seconds_to_ticks(self.shape.time(self.index - 1));
            self.end_tick = match self.shape.sustain {
                Some(sustain) if self.index <= sustain => duration.min(end_tick),
                _ => end_tick,
            };
        }

        self.target = self.shape.levels[self.index];
        self.curve = self.shape.curves.for_segment(self.index);
        self.start_value = self.value;

        let count = (end_tick - tick) / transport.dtick();
        if count > 0.0 {
            if self.curve != 0.0 {
                self.a1 = (self.target - self.value) / (1.0 - self.curve.exp());
                self.a2 = self.value + self.a1;
                self.grow = (self.curve / count.ceil()).exp();
            } else {
                self.grow = (self.target - self.value) / count;
            }
        } else {
            self.grow = 0.0;
            self.curve = 0.0;
        }

        self.total_duration = match self.shape.sustain {
            Some(sustain) if sustain > 0 => {
                duration + transport.seconds_to_ticks(self.shape.time(sustain))
            }
            _ => transport.seconds_to_ticks(self.shape.times.iter().sum()),
        };

        true
    }

    /// Value at `tick` (ticks since the voice started).
    pub fn value(&mut self, tick: f64, transport: &Transport) -> f64 {
        while tick > self.end_tick && self.step(tick, transport) {}

        if self.curve != 0.0 {
            self.a1 *= self.grow;
            self.value = self.a2 - self.a1;
        } else {
            self.value += self.grow;
        }

        let low = self.start_value.min(self.target);
        let high = self.start_value.max(self.target);
        self.value = self.value.clamp(low, high);
        self.value
    }

    pub fn duration(&self) -> f64 {
        self.total_duration
    }

    pub fn segment(&self) -> usize {
        self.index
    }
}

/// A voice envelope.
#[derive(Debug, Clone)]
pub enum Envelope {
    Segments(SegmentEnvelope),
    /// Constant 1 until the `duration` option runs out.
    Hold { options: Options },
}

impl Envelope {
    /// Build the envelope named by the `env` option, merging its defaults into
    /// `options`.
    pub fn create(options: &Options, transport: &Transport) -> Result<Self> {
        let kind = EnvelopeKind::from_name(options.text("env").as_deref().unwrap_or("adsr"));
        options.extend(&kind.defaults());
        Self::build(kind, options, transport)
    }

    fn build(kind: EnvelopeKind, options: &Options, transport: &Transport) -> Result<Self> {
        let shape = match kind {
            EnvelopeKind::Adsr => {
                let attack = options.number_or("attack", 0.0)?;
                let decay = options.number_or("decay", 0.0)?;
                let sustain = options.number_or("sustain", 1.0)?;
                let release = options.number_or("release", 0.5)?;
                let duration = options
                    .number_or("duration", 0.0)?
                    .max(transport.seconds_to_ticks(attack + decay));
                let curves = match options.list("curve")? {
                    Some(list) if list.len() > 1 => list,
                    Some(list) => {
                        let c = list.first().copied().unwrap_or(-2.0);
                        vec![0.0, c, c]
                    }
                    None => vec![0.0, -2.0, -2.0],
                };
                SegmentShape::new(
                    vec![if attack > 0.0 { 0.0 } else { 1.0 }, 1.0, sustain, 0.0],
                    vec![attack, decay, release],
                    duration,
                    curves,
                    Some(2),
                )
            }
            EnvelopeKind::Adsr2 => {
                let attack = options.number_or("attack", 0.0)?;
                let decay = options.number_or("decay", 0.0)?;
                let sustain = options.number_or("sustain", 0.0)?;
                let release = options.number_or("release", 1.0)?;
                let attack_level = options.number_or("attack_level", 1.0)?;
                let times = [attack, decay, sustain, release]
                    .iter()
                    .map(|t| transport.ticks_to_seconds(*t))
                    .collect();
                SegmentShape::new(
                    vec![
                        if attack > 0.0 { 0.0 } else { attack_level },
                        attack_level,
                        options.number_or("decay_level", 1.0)?,
                        options.number_or("sustain_level", 1.0)?,
                        0.0,
                    ],
                    times,
                    attack + decay + sustain + release,
                    vec![0.0; 4],
                    None,
                )
            }
            EnvelopeKind::Segenv => {
                let levels = options.require_list("levels")?;
                let times = options.require_list("times")?;
                let duration = options.number_or("duration", 0.5)?;
                let release_node = options.number_or("release_node", -1.0)?;
                let sustain = (release_node >= 0.0).then_some(release_node as usize);
                match options.list("curves")? {
                    Some(curves) => SegmentShape::new(levels, times, duration, curves, sustain),
                    None => SegmentShape::with_uniform_curve(
                        levels,
                        times,
                        duration,
                        options.number_or("curve", 0.0)?,
                        sustain,
                    ),
                }
            }
            EnvelopeKind::One => {
                return Ok(Envelope::Hold {
                    options: options.clone(),
                })
            }
        };
        Ok(Envelope::Segments(SegmentEnvelope::new(shape, transport)))
    }

    /// Total duration in ticks.
    pub fn duration(&self) -> Result<f64> {
        match self {
            Envelope::Segments(envelope) => Ok(envelope.duration()),
            Envelope::Hold { options } => options.number_or("duration", HOLD_FOREVER),
        }
    }

    pub fn is_active(&self, tick: f64) -> Result<bool> {
        Ok(tick < self.duration()?)
    }

    pub fn value(&mut self, tick: f64, transport: &Transport) -> f64 {
        match self {
            Envelope::Segments(envelope) => envelope.value(tick, transport),
            Envelope::Hold { .. } => 1.0,
        }
    }

    /// Advance to `tick` and report the state a waveform sees.
    pub fn view(&mut self, tick: f64, transport: &Transport) -> Result<EnvelopeView> {
        let value = self.value(tick, transport);
        let duration = self.duration()?;
        Ok(EnvelopeView {
            value,
            progress: if duration > 0.0 { clamp01(tick / duration) } else { 1.0 },
            duration,
            active: tick < duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextHandle;

    fn setup() -> (ContextHandle, Transport) {
        let ctx = ContextHandle::new(120.0, 44100).unwrap();
        let transport = ctx.transport();
        (ctx, transport)
    }

    fn run(envelope: &mut Envelope, transport: &Transport, samples: usize) -> Vec<f64> {
        (0..samples)
            .map(|n| envelope.value(n as f64 * transport.dtick(), transport))
            .collect()
    }

    #[test]
    fn test_kind_lookup_falls_back_to_adsr() {
        assert_eq!(EnvelopeKind::from_name("segenv"), EnvelopeKind::Segenv);
        assert_eq!(EnvelopeKind::from_name("nope"), EnvelopeKind::Adsr);
        assert_eq!(EnvelopeKind::One.name(), "one");
    }

    #[test]
    fn test_adsr_defaults_are_merged() {
        let (ctx, transport) = setup();
        let options = Options::new(&ctx, OptionSet::new().with("env", "adsr").with("release", 0.25));
        let envelope = Envelope::create(&options, &transport).unwrap();
        assert_eq!(options.number("release").unwrap(), Some(0.25));
        assert_eq!(options.number("sustain").unwrap(), Some(1.0));
        // duration 0 + release 0.25s = 0.5 ticks at 120 bpm
        assert!((envelope.duration().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_adsr_holds_then_releases() {
        let (ctx, transport) = setup();
        let options = Options::new(
            &ctx,
            OptionSet::new().with("duration", 1.0).with("release", 0.5),
        );
        let mut envelope = Envelope::create(&options, &transport).unwrap();
        assert!((envelope.duration().unwrap() - 2.0).abs() < 1e-12);

        let values = run(&mut envelope, &transport, 44100);
        // the hold lasts one tick (22050 samples)
        assert!(values[..22000].iter().all(|v| (v - 1.0).abs() < 1e-9));
        let release = &values[22100..];
        assert!(release.windows(2).all(|w| w[1] <= w[0] + 1e-12));
        assert!(*release.last().unwrap() < 0.01);
        assert!(release.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_linear_attack_is_monotonic_and_bounded() {
        let (ctx, transport) = setup();
        let options = Options::new(
            &ctx,
            OptionSet::new().with("attack", 0.1).with("duration", 2.0),
        );
        let mut envelope = Envelope::create(&options, &transport).unwrap();
        // 0.1s attack = 4410 samples
        let values = run(&mut envelope, &transport, 4400);
        assert!(values[0] >= 0.0 && values[0] < 0.01);
        assert!(values.windows(2).all(|w| w[1] >= w[0]));
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(values[4399] > 0.95);
    }

    #[test]
    fn test_exponential_segment_lands_on_target() {
        let (_ctx, transport) = setup();
        let shape = SegmentShape::new(vec![1.0, 0.0], vec![0.1], 0.0, vec![-4.0], None);
        let mut envelope = Envelope::Segments(SegmentEnvelope::new(shape, &transport));
        let values = run(&mut envelope, &transport, 4411);
        assert!(values.windows(2).all(|w| w[1] <= w[0]));
        assert!(values[4410].abs() < 1e-6);
    }

    #[test]
    fn test_zero_length_segment_does_not_divide_by_zero() {
        let (ctx, transport) = setup();
        let options = Options::new(
            &ctx,
            OptionSet::new()
                .with("env", "segenv")
                .with("levels", vec![0.0, 1.0, 0.0])
                .with("times", vec![0.0, 0.1])
                .with("release_node", -1.0),
        );
        let mut envelope = Envelope::create(&options, &transport).unwrap();
        let values = run(&mut envelope, &transport, 100);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_adsr2_uses_ticks() {
        let (ctx, transport) = setup();
        let options = Options::new(
            &ctx,
            OptionSet::new()
                .with("env", "adsr2")
                .with("attack", 0.5)
                .with("sustain", 1.0)
                .with("release", 0.5),
        );
        let envelope = Envelope::create(&options, &transport).unwrap();
        assert!((envelope.duration().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_one_envelope_reads_duration_live() {
        let (ctx, transport) = setup();
        let options = Options::new(&ctx, OptionSet::new().with("env", "one"));
        let mut envelope = Envelope::create(&options, &transport).unwrap();
        assert_eq!(envelope.duration().unwrap(), HOLD_FOREVER);
        assert_eq!(envelope.value(10.0, &transport), 1.0);
        options.set_now("duration", 4.0.into());
        assert!(envelope.is_active(3.9).unwrap());
        assert!(!envelope.is_active(4.0).unwrap());
    }

    #[test]
    fn test_view_reports_progress() {
        let (ctx, transport) = setup();
        let options = Options::new(&ctx, OptionSet::new().with("env", "one").with("duration", 2.0));
        let mut envelope = Envelope::create(&options, &transport).unwrap();
        let view = envelope.view(1.0, &transport).unwrap();
        assert_eq!(view.value, 1.0);
        assert!((view.progress - 0.5).abs() < 1e-12);
        assert!(view.active);
    }
}

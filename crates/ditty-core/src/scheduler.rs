//! Loop scheduler.
//!
//! A [`LiveLoop`] alternates between filling and playing. Filling runs the
//! loop body in a dry pass: note triggers and option writes are recorded as
//! operators at the tick they were issued, the tick the body consumed with
//! `sleep` becomes the lap length, and the transport is rewound. Playing then
//! applies the recorded operators sample by sample as the transport passes
//! their start ticks, mixes the loop's voices and runs its filter chain.
//!
//! The next fill happens when the transport reaches the loop's end tick:
//!
//! - with `sync > 0` the end is the next multiple of `sync` after the start
//! - otherwise the end is `start + lap`

use std::collections::VecDeque;

use crate::context::ContextHandle;
use crate::error::Result;
use crate::filter::FilterChain;
use crate::messages::NoteEvent;
use crate::operator::{sort_operators, Operator};
use crate::options::Options;
use crate::synth::{pan_amp, Frame, SynthVoice};
use crate::timing::round_ticks;

/// Warning attached to loops whose lap has no length.
pub const NO_DURATION_WARNING: &str = "has no duration. Use sleep() or set sync option.";

/// User code run once per loop cycle.
pub trait LoopBody: Send {
    fn run(&mut self, cycle: u64, options: &Options) -> Result<()>;
}

impl<F> LoopBody for F
where
    F: FnMut(u64, &Options) -> Result<()> + Send,
{
    fn run(&mut self, cycle: u64, options: &Options) -> Result<()> {
        self(cycle, options)
    }
}

/// Scheduler state of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not filled yet.
    Idle,
    /// Running the body to record the next cycle.
    Filling,
    /// Applying the recorded cycle.
    Playing,
}

/// A declared loop instantiated inside its generator task.
pub struct LiveLoop {
    name: String,
    options: Options,
    body: Box<dyn LoopBody>,
    ctx: ContextHandle,
    state: LoopState,
    cycle: u64,
    end_tick: f64,
    lap: f64,
    operators: VecDeque<Operator>,
    voices: Vec<SynthVoice>,
    filters: FilterChain,
    warned: bool,
}

impl LiveLoop {
    pub fn new(
        ctx: &ContextHandle,
        name: &str,
        options: Options,
        body: Box<dyn LoopBody>,
        filters: FilterChain,
    ) -> Self {
        Self {
            name: name.to_string(),
            options,
            body,
            ctx: ctx.clone(),
            state: LoopState::Idle,
            cycle: 0,
            end_tick: -1.0,
            lap: 0.0,
            operators: VecDeque::new(),
            voices: Vec::new(),
            filters,
            warned: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of cycles filled so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn end_tick(&self) -> f64 {
        self.end_tick
    }

    /// Ticks consumed by the last fill.
    pub fn lap(&self) -> f64 {
        self.lap
    }

    /// Operators still waiting for their start tick.
    pub fn pending(&self) -> impl Iterator<Item = &Operator> {
        self.operators.iter()
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Run the body for the next cycle and schedule what it recorded.
    ///
    /// Errors from the body are returned after the transport and the
    /// recorder have been restored.
    pub fn fill(&mut self) -> Result<()> {
        self.state = LoopState::Filling;
        let start = self.ctx.tick();

        let previous = self.ctx.begin_recording();
        let result = self.body.run(self.cycle, &self.options);
        let mut operators = self.ctx.end_recording(previous);

        self.lap = self.ctx.tick() - start;
        self.ctx.set_tick(start);
        result?;

        let sync = self.options.number_or("sync", -1.0)?;
        let end = if sync > 0.0 {
            ((start / sync).floor() + 1.0) * sync
        } else {
            start + self.lap
        };
        self.end_tick = round_ticks(end);

        if self.end_tick <= start {
            if !self.warned {
                log::warn!("[LOOP] {} {}", self.name, NO_DURATION_WARNING);
                self.warned = true;
            }
            self.ctx.debug(|d| d.warn(&self.name, NO_DURATION_WARNING));
        }

        sort_operators(&mut operators);
        log::trace!(
            "[LOOP] {} cycle {} filled: {} operators, ends at {}",
            self.name,
            self.cycle,
            operators.len(),
            self.end_tick
        );
        self.operators = operators.into();
        self.cycle += 1;
        self.state = LoopState::Playing;
        Ok(())
    }

    /// Apply every operator that starts before `tick`.
    fn apply_due(&mut self, tick: f64) -> Result<()> {
        while self.operators.front().is_some_and(|op| op.start_tick() < tick) {
            let Some(operator) = self.operators.pop_front() else {
                break;
            };
            match operator {
                Operator::NoteOn { voice, .. } => {
                    self.ctx.push_note(NoteEvent {
                        note: voice.note()?,
                        tick,
                        loop_name: self.name.clone(),
                        voice: voice.name().to_string(),
                        duration: voice.duration()?,
                    });
                    self.voices.push(*voice);
                }
                Operator::ParamChange {
                    target, key, value, ..
                } => target.set_now(&key, value),
            }
        }
        Ok(())
    }

    /// Render one frame at the current transport position.
    pub fn process(&mut self) -> Result<Frame> {
        let tick = self.ctx.tick();
        if self.state == LoopState::Idle || tick >= self.end_tick {
            self.fill()?;
        }
        self.apply_due(tick)?;

        let transport = self.ctx.transport();
        let mut mix = [0.0, 0.0];
        let mut failure = None;
        self.voices.retain_mut(|voice| {
            if failure.is_some() {
                return true;
            }
            match voice.process(&transport) {
                Ok(Some(frame)) => {
                    mix[0] += frame[0];
                    mix[1] += frame[1];
                    true
                }
                Ok(None) => false,
                Err(err) => {
                    failure = Some(err);
                    true
                }
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }

        let pan = self.options.number_or("pan", 0.0)?;
        let amp = self.options.number_or("amp", 1.0)?;
        self.filters.process(pan_amp(mix, pan, amp))
    }
}

//! Engine configuration.
//!
//! [`EngineConfig`] carries the sizes and time constants shared by every task
//! of a session. The defaults match the reference engine; the buffer-pool
//! lookahead and the gain smoothing rate are exposed so they can be tuned.

use crate::error::{DittyError, Result};

/// Frames per rendered buffer (one macro-buffer).
pub const BUFFER_LENGTH: usize = 640;

/// Buffers each producer owns.
pub const NUM_BUFFERS: usize = 4;

/// Queued buffers every producer must exceed before a bus starts mixing.
pub const LOOKAHEAD: usize = 3;

/// Per-sample gain smoothing factor.
pub const GAIN_SMOOTHING: f32 = 0.001;

/// Divisor of the level meter's sum of squares.
pub const LEVEL_WINDOW: f32 = 512.0;

/// Scale applied to the master mix.
pub const MASTER_HEADROOM: f32 = 0.5;

/// Default tempo in beats (ticks) per minute.
pub const DEFAULT_BPM: f64 = 120.0;

/// Default sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Device frames per host callback.
pub const DEVICE_FRAMES: usize = 128;

/// Settings shared by the orchestrator, generator tasks and the render callback.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub bpm: f64,
    /// Frames per buffer.
    pub buffer_length: usize,
    /// Buffers per producer.
    pub num_buffers: usize,
    /// Minimum queue depth (exclusive) before a bus starts.
    pub lookahead: usize,
    pub gain_smoothing: f32,
    pub level_window: f32,
    pub master_headroom: f32,
    /// Frames per device callback, used by offline hosts.
    pub device_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            bpm: DEFAULT_BPM,
            buffer_length: BUFFER_LENGTH,
            num_buffers: NUM_BUFFERS,
            lookahead: LOOKAHEAD,
            gain_smoothing: GAIN_SMOOTHING,
            level_window: LEVEL_WINDOW,
            master_headroom: MASTER_HEADROOM,
            device_frames: DEVICE_FRAMES,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_bpm(mut self, bpm: f64) -> Self {
        self.bpm = bpm;
        self
    }

    pub fn with_buffer_length(mut self, frames: usize) -> Self {
        self.buffer_length = frames;
        self
    }

    pub fn with_num_buffers(mut self, count: usize) -> Self {
        self.num_buffers = count;
        self
    }

    pub fn with_lookahead(mut self, depth: usize) -> Self {
        self.lookahead = depth;
        self
    }

    pub fn with_gain_smoothing(mut self, rate: f32) -> Self {
        self.gain_smoothing = rate;
        self
    }

    pub fn with_device_frames(mut self, frames: usize) -> Self {
        self.device_frames = frames;
        self
    }

    /// Check the configuration for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(DittyError::Config("sample rate must be positive".to_string()));
        }
        if !(self.bpm > 0.0) || !self.bpm.is_finite() {
            return Err(DittyError::Config(format!("invalid bpm: {}", self.bpm)));
        }
        if self.buffer_length == 0 || self.device_frames == 0 {
            return Err(DittyError::Config("buffer sizes must be positive".to_string()));
        }
        if self.num_buffers <= self.lookahead {
            return Err(DittyError::Config(format!(
                "{} buffers per producer can never exceed a lookahead of {}",
                self.num_buffers, self.lookahead
            )));
        }
        if !(self.gain_smoothing > 0.0 && self.gain_smoothing <= 1.0) {
            return Err(DittyError::Config(format!(
                "gain smoothing must be in (0, 1], got {}",
                self.gain_smoothing
            )));
        }
        if !(self.level_window > 0.0) {
            return Err(DittyError::Config("level window must be positive".to_string()));
        }
        Ok(())
    }
}

//! Musical time for ditty.
//!
//! Ticks are tempo-relative beats. A [`Transport`] owns the tick position of
//! one task and converts between ticks and seconds at its current tempo:
//!
//! - `ticks_to_seconds(t) = t * 60 / bpm`
//! - `seconds_to_ticks(s) = s * bpm / 60`
//! - per-sample increment `dtick = bpm / (60 * sample_rate)`
//!
//! Changing the tempo only changes `dtick`. Anything already expressed in ticks
//! (recorded operators, loop end ticks) keeps its value and simply plays back
//! faster or slower in real time.

use crate::error::{DittyError, Result};

/// Convert ticks to seconds at the given tempo.
pub fn ticks_to_seconds(ticks: f64, bpm: f64) -> f64 {
    ticks * 60.0 / bpm
}

/// Convert seconds to ticks at the given tempo.
pub fn seconds_to_ticks(seconds: f64, bpm: f64) -> f64 {
    seconds * bpm / 60.0
}

/// Round a tick position to three decimals.
///
/// Loop boundaries are rounded so float drift does not accumulate across cycles.
pub fn round_ticks(ticks: f64) -> f64 {
    (ticks * 1e3).round() / 1e3
}

/// Point-in-time copy of a transport, sent with telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TransportSnapshot {
    pub tick: f64,
    pub time: f64,
    pub bpm: f64,
    pub sample_rate: u32,
}

/// Sample-accurate musical clock owned by a single task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transport {
    bpm: f64,
    sample_rate: u32,
    tick: f64,
    time: f64,
    dtick: f64,
    dt: f64,
}

impl Transport {
    /// Create a transport at tick 0.
    pub fn new(bpm: f64, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(DittyError::Config("sample rate must be positive".to_string()));
        }
        let mut transport = Self {
            bpm,
            sample_rate,
            tick: 0.0,
            time: 0.0,
            dtick: 0.0,
            dt: 1.0 / sample_rate as f64,
        };
        transport.set_bpm(bpm)?;
        Ok(transport)
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    /// Change the tempo. Only the per-sample increment is recomputed.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        if !(bpm > 0.0) || !bpm.is_finite() {
            return Err(DittyError::Config(format!("invalid bpm: {}", bpm)));
        }
        self.bpm = bpm;
        self.dtick = bpm / (60.0 * self.sample_rate as f64);
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn tick(&self) -> f64 {
        self.tick
    }

    /// Elapsed rendered time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Ticks advanced per rendered sample.
    pub fn dtick(&self) -> f64 {
        self.dtick
    }

    /// Seconds per rendered sample.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn ticks_to_seconds(&self, ticks: f64) -> f64 {
        ticks_to_seconds(ticks, self.bpm)
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> f64 {
        seconds_to_ticks(seconds, self.bpm)
    }

    /// Move the tick position without rendering.
    ///
    /// Used by speculative evaluation (`sleep`, timed notes) which always
    /// restores the position afterwards.
    pub fn set_tick(&mut self, tick: f64) {
        self.tick = tick;
    }

    /// Advance by one rendered sample.
    pub fn advance(&mut self) {
        self.tick += self.dtick;
        self.time += self.dt;
    }

    /// Advance by a number of rendered frames.
    pub fn advance_frames(&mut self, frames: usize) {
        let frames = frames as f64;
        self.tick += self.dtick * frames;
        self.time += self.dt * frames;
    }

    /// Return to tick 0. Only used on a full transport reset.
    pub fn reset(&mut self) {
        self.tick = 0.0;
        self.time = 0.0;
    }

    pub fn snapshot(&self) -> TransportSnapshot {
        TransportSnapshot {
            tick: self.tick,
            time: self.time,
            bpm: self.bpm,
            sample_rate: self.sample_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_round_trip() {
        for bpm in [1.0, 60.0, 97.5, 120.0, 174.0, 999.0] {
            for ticks in [0.0, 0.25, 1.0, 3.75, 64.0, 1234.5] {
                let back = seconds_to_ticks(ticks_to_seconds(ticks, bpm), bpm);
                assert!((back - ticks).abs() < 1e-9, "bpm {} ticks {}", bpm, ticks);
            }
        }
    }

    #[test]
    fn test_dtick() {
        let transport = Transport::new(120.0, 44100).unwrap();
        assert!((transport.dtick() - 120.0 / (60.0 * 44100.0)).abs() < 1e-15);
        assert!((transport.seconds_to_ticks(1.0) - 2.0).abs() < 1e-12);
        assert!((transport.ticks_to_seconds(4.0) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_one_second_of_samples_is_two_ticks_at_120() {
        let mut transport = Transport::new(120.0, 44100).unwrap();
        transport.advance_frames(44100);
        assert!((transport.tick() - 2.0).abs() < 1e-9);
        assert!((transport.time() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_bpm_keeps_tick_position() {
        let mut transport = Transport::new(120.0, 44100).unwrap();
        transport.advance_frames(4410);
        let tick = transport.tick();
        transport.set_bpm(60.0).unwrap();
        assert_eq!(transport.tick(), tick);
        assert!((transport.dtick() - 60.0 / (60.0 * 44100.0)).abs() < 1e-15);
    }

    #[test]
    fn test_invalid_tempo_rejected() {
        let mut transport = Transport::new(120.0, 44100).unwrap();
        assert!(transport.set_bpm(0.0).is_err());
        assert!(transport.set_bpm(-10.0).is_err());
        assert!((transport.bpm() - 120.0).abs() < 1e-12);
        assert!(Transport::new(120.0, 0).is_err());
    }

    #[test]
    fn test_round_ticks() {
        assert_eq!(round_ticks(1.23456), 1.235);
        assert_eq!(round_ticks(4.0004), 4.0);
        assert_eq!(round_ticks(0.0), 0.0);
    }
}

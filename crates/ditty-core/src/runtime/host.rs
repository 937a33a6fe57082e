//! Audio hosts.
//!
//! A host is the external clock that pulls the [`RenderCallback`]. The
//! session installs its callback once and then only suspends and resumes the
//! host; everything else reaches the callback through its control channel.

use crate::error::{DittyError, Result};

use super::render::{RenderCallback, RenderOutcome};

/// Something that periodically pulls a render callback.
pub trait AudioHost {
    /// Take ownership of the callback. The host starts suspended.
    fn install(&mut self, callback: RenderCallback) -> Result<()>;

    /// Start or continue pulling.
    fn resume(&mut self) -> Result<()>;

    /// Stop pulling. The callback keeps its state.
    fn suspend(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// The rate the host plays at, if it dictates one.
    fn sample_rate(&self) -> Option<u32> {
        None
    }

    /// Whether the host is driven by a hardware clock. Offline hosts pull
    /// faster than generators render, so their underruns are expected.
    fn realtime(&self) -> bool {
        true
    }
}

/// A host pulled by hand. Used for tests and offline rendering.
pub struct OfflineHost {
    callback: Option<RenderCallback>,
    running: bool,
    device_frames: usize,
}

impl OfflineHost {
    /// A host pulling `device_frames` stereo frames per call.
    pub fn new(device_frames: usize) -> Self {
        Self {
            callback: None,
            running: false,
            device_frames: device_frames.max(1),
        }
    }

    pub fn device_frames(&self) -> usize {
        self.device_frames
    }

    /// Pull one device block into `out` (interleaved stereo).
    ///
    /// A suspended host writes silence and does not touch the callback.
    pub fn pull_into(&mut self, out: &mut [f32]) -> RenderOutcome {
        match &mut self.callback {
            Some(callback) if self.running => callback.render(out),
            _ => {
                out.fill(0.0);
                RenderOutcome::Suspended
            }
        }
    }

    /// Pull `blocks` device blocks and return the samples.
    pub fn pull(&mut self, blocks: usize) -> Vec<f32> {
        let mut out = vec![0.0; blocks * self.device_frames * 2];
        for block in out.chunks_mut(self.device_frames * 2) {
            self.pull_into(block);
        }
        out
    }

    pub fn callback(&self) -> Option<&RenderCallback> {
        self.callback.as_ref()
    }
}

impl Default for OfflineHost {
    fn default() -> Self {
        Self::new(crate::config::DEVICE_FRAMES)
    }
}

impl AudioHost for OfflineHost {
    fn install(&mut self, callback: RenderCallback) -> Result<()> {
        self.callback = Some(callback);
        self.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        if self.callback.is_none() {
            return Err(DittyError::Audio("no render callback installed".to_string()));
        }
        self.running = true;
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn realtime(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::render::MeterBank;
    use crossbeam_channel::bounded;
    use std::sync::Arc;

    #[test]
    fn test_offline_host_lifecycle() {
        let mut host = OfflineHost::new(16);
        assert!(host.resume().is_err());

        let (_control, control_rx) = bounded(4);
        let (events, _events_rx) = bounded(4);
        let callback =
            RenderCallback::new(&EngineConfig::default(), control_rx, events, Arc::new(MeterBank::new(1))).unwrap();
        host.install(callback).unwrap();
        assert!(!host.is_running());

        let mut out = vec![1.0; 32];
        assert_eq!(host.pull_into(&mut out), RenderOutcome::Suspended);
        assert!(out.iter().all(|&s| s == 0.0));

        host.resume().unwrap();
        assert!(host.is_running());
        assert_eq!(host.pull(2).len(), 64);
        host.suspend().unwrap();
        assert!(!host.is_running());
    }
}

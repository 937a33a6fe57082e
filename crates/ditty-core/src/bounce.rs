//! Offline rendering to WAV.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::error::{DittyError, Result};
use crate::runtime::{OfflineHost, RenderOutcome, Session, SessionEvent};

/// How long the generators may fall behind before a bounce gives up.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Render `seconds` of the session's compiled score into a 32-bit float stereo WAV file.
///
/// Starts the session if it is stopped and stops it when done. The bounce
/// waits for the generators instead of writing the silence a starved device
/// would play, so the file has no gaps. Returns the number of frames written.
pub fn render_to_wav(path: impl AsRef<Path>, session: &mut Session<OfflineHost>, seconds: f64) -> Result<u64> {
    let path = path.as_ref();
    let sample_rate = session.config().sample_rate;
    let block_frames = session.config().buffer_length;
    let total = (seconds.max(0.0) * sample_rate as f64).round() as u64;

    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;

    let events = session.subscribe();
    if session.stopped() {
        session.play()?;
    }

    // one macro-buffer per pull keeps a starved pull all silence
    let mut block = vec![0.0f32; block_frames * 2];
    let mut written = 0u64;
    let mut last_progress = Instant::now();
    while written < total {
        let outcome = session.host_mut().pull_into(&mut block);
        session.poll();
        if let Some(error) = events.try_iter().find_map(|e| match e {
            SessionEvent::Error { source, message } => Some(DittyError::runtime(&source, &message)),
            _ => None,
        }) {
            return Err(error);
        }

        match outcome {
            RenderOutcome::Played => {
                let frames = (total - written).min(block_frames as u64) as usize;
                for sample in &block[..frames * 2] {
                    writer.write_sample(*sample)?;
                }
                written += frames as u64;
                last_progress = Instant::now();
            }
            RenderOutcome::Starved | RenderOutcome::Suspended => {
                if last_progress.elapsed() > STALL_TIMEOUT {
                    return Err(DittyError::Audio(format!(
                        "render stalled after {} of {} frames",
                        written, total
                    )));
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    writer.finalize()?;
    session.stop()?;
    log::info!("[RENDER] wrote {} frames to {}", written, path.display());
    Ok(written)
}

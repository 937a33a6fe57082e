//! Offline rendering for ditty.
//!
//! Plays the score on the offline host as fast as the generator tasks can
//! render and writes the result to a 32-bit float WAV file.

use crate::{read_score, RenderArgs};
use anyhow::{Context, Result};
use ditty_core::{render_to_wav, OfflineHost, Session};

/// Render a score file to a WAV file.
pub fn render(args: &RenderArgs) -> Result<()> {
    log::info!("Ditty Render");
    log::info!("============");
    log::info!("Input:  {}", args.file.display());
    log::info!("Output: {}", args.output.display());

    if args.output.extension().and_then(|e| e.to_str()) != Some("wav") {
        log::warn!("Output is written as WAV regardless of its extension");
    }

    let code = read_score(&args.file)?;
    let config = args.engine.config()?;
    let host = OfflineHost::new(config.device_frames);
    let mut session = Session::new(config, host).context("Failed to start session")?;
    args.engine.apply(&mut session)?;
    session
        .compile(&code)
        .with_context(|| format!("Failed to compile {}", args.file.display()))?;

    let frames = render_to_wav(&args.output, &mut session, args.duration.as_secs_f64())
        .with_context(|| format!("Failed to render {}", args.file.display()))?;

    log::info!(
        "Rendered {:.2}s ({} frames) to {}",
        frames as f64 / session.config().sample_rate as f64,
        frames,
        args.output.display()
    );
    Ok(())
}

//! Ditty CLI - The `ditty` command.
//!
//! This is the main entry point for playing, checking and rendering ditty scores.
//!
//! # Architecture
//!
//! The binary is a thin shell around **ditty-core**: it reads the score,
//! maps flags onto the engine configuration and drives a [`Session`] on
//! either the native audio output or the offline host.

mod render;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ditty_core::{
    validate_score, CpalHost, AudioConfig, AudioHost, EngineConfig, GainUpdate, NodeKind, ScoreStructure, Session,
    SessionEvent,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Ditty - live-coded loops, synths and filters
#[derive(Parser, Debug)]
#[command(name = "ditty")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A live-coding audio engine for loop-based scores", long_about = None)]
struct Args {
    /// Log at debug level (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a score through an audio device
    Run {
        /// Path to the score to play
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Output device name (see `ditty devices`)
        #[arg(long)]
        device: Option<String>,

        /// Stop after this long, e.g. "90s" or "2m"
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,

        /// Recompile and restart whenever the file changes
        #[arg(short, long)]
        watch: bool,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Dry-run a score and print its structure
    Check {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        engine: EngineArgs,
    },

    /// Render a score offline to a WAV file
    Render(RenderArgs),

    /// List audio output devices
    Devices,

    /// Show version information
    Version,
}

/// Engine settings shared by the subcommands.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Tempo before the score sets its own
    #[arg(long)]
    bpm: Option<f64>,

    /// Sample rate in Hz (the device rate wins when playing)
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Buffers every producer must queue before a bus starts mixing
    #[arg(long)]
    lookahead: Option<usize>,

    /// Score input, readable with input("key")
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_pair)]
    params: Vec<(String, f64)>,

    /// Gain of a loop or shared filter
    #[arg(long = "gain", value_name = "NAME=AMP", value_parser = parse_pair)]
    gains: Vec<(String, f64)>,

    /// Master gain
    #[arg(long)]
    master: Option<f32>,
}

impl EngineArgs {
    fn config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::default();
        if let Some(bpm) = self.bpm {
            config = config.with_bpm(bpm);
        }
        if let Some(rate) = self.sample_rate {
            config = config.with_sample_rate(rate);
        }
        if let Some(lookahead) = self.lookahead {
            let num_buffers = config.num_buffers.max(lookahead + 1);
            config = config.with_lookahead(lookahead).with_num_buffers(num_buffers);
        }
        config.validate().context("Invalid engine settings")?;
        Ok(config)
    }

    /// Push the initial inputs and gains into a session.
    fn apply<H: AudioHost>(&self, session: &mut Session<H>) -> Result<()> {
        if !self.params.is_empty() {
            session.set_params(&self.params)?;
        }
        let update = self
            .gains
            .iter()
            .fold(GainUpdate::new(), |update, (name, gain)| update.with_input(name, *gain as f32));
        let update = match self.master {
            Some(master) => update.with_master(master),
            None => update,
        };
        if !update.is_empty() {
            session.set_gain(update)?;
        }
        Ok(())
    }
}

/// Arguments of `ditty render`.
#[derive(clap::Args, Debug)]
pub struct RenderArgs {
    /// Path to the score to render
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Output WAV file
    #[arg(short, long, default_value = "out.wav")]
    pub output: PathBuf,

    /// Length of the render
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub duration: Duration,

    #[command(flatten)]
    pub engine: EngineArgs,
}

fn parse_pair(s: &str) -> std::result::Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid value for '{}': {}", key, e))?;
    Ok((key.trim().to_string(), value))
}

fn init_logger(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    match args.command {
        Commands::Run {
            file,
            device,
            duration,
            watch,
            engine,
        } => run_file(&file, device, duration, watch, &engine),
        Commands::Check { file, engine } => check_file(&file, &engine),
        Commands::Render(args) => render::render(&args),
        Commands::Devices => {
            ditty_core::print_audio_devices()?;
            Ok(())
        }
        Commands::Version => {
            println!("ditty {}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("A live-coding audio engine for loop-based scores");
            println!();
            println!("Modular Architecture:");
            println!("  - ditty-core: scheduling, buffer pool, Rhai score API, runtime");
            println!("  - ditty-cli:  the ditty command");
            Ok(())
        }
    }
}

pub(crate) fn read_score(file: &Path) -> Result<String> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    if file.extension().and_then(|s| s.to_str()) != Some("ditty") {
        log::warn!("File doesn't have .ditty extension");
    }
    fs::read_to_string(file).with_context(|| format!("Failed to read file: {}", file.display()))
}

fn modified(file: &Path) -> Option<SystemTime> {
    fs::metadata(file).ok().and_then(|m| m.modified().ok())
}

fn run_file(
    file: &Path,
    device: Option<String>,
    duration: Option<Duration>,
    watch: bool,
    engine: &EngineArgs,
) -> Result<()> {
    let code = read_score(file)?;
    let config = engine.config()?;

    let audio = AudioConfig::new()
        .with_device(device)
        .with_sample_rate(engine.sample_rate);
    let host = CpalHost::open(&audio).context("Failed to open audio output")?;
    let mut session = Session::new(config, host).context("Failed to start session")?;
    let events = session.subscribe();
    engine.apply(&mut session)?;

    session
        .compile(&code)
        .with_context(|| format!("Failed to compile {}", file.display()))?;
    if let Some(structure) = session.structure() {
        print_structure(structure);
    }
    session.play()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("Failed to install signal handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("Failed to install signal handler")?;

    log::info!("Playing {} (Press Ctrl+C to exit)", file.display());
    let started = Instant::now();
    let mut last_modified = modified(file);
    let mut last_levels = Instant::now();

    while !shutdown.load(Ordering::Relaxed) {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }

        session.poll();
        for event in events.try_iter() {
            if let SessionEvent::Error { source, message } = &event {
                if !watch {
                    anyhow::bail!("{} failed: {}", source, message);
                }
                log::error!("{} failed, waiting for changes: {}", source, message);
            }
            report(&event);
        }

        if last_levels.elapsed() >= Duration::from_secs(1) {
            last_levels = Instant::now();
            let levels: Vec<String> = session
                .levels()
                .iter()
                .map(|l| format!("{} {:.3}", l.name, l.volume))
                .collect();
            log::debug!("levels: {} | master {:.3}", levels.join(", "), session.master_level());
        }

        if watch {
            let current = modified(file);
            if current != last_modified {
                last_modified = current;
                reload(&mut session, file);
            }
        }

        thread::sleep(Duration::from_millis(20));
    }

    log::info!("Stopping...");
    session.stop()?;
    Ok(())
}

/// Recompile a changed score. A score that fails to compile leaves the old one playing.
fn reload<H: AudioHost>(session: &mut Session<H>, file: &Path) {
    log::info!("File changed, reloading...");
    let code = match fs::read_to_string(file) {
        Ok(code) => code,
        Err(e) => {
            log::error!("Failed to read file: {}", e);
            return;
        }
    };
    if let Err(e) = session.compile(&code) {
        log::error!("Reload failed: {}", e);
        return;
    }
    match session.play() {
        Ok(()) => log::info!("Reload successful"),
        Err(e) => log::error!("Reload failed: {}", e),
    }
}

fn report(event: &SessionEvent) {
    match event {
        SessionEvent::Note(note) => log::debug!(
            "{} {} {:.1} at tick {:.2} ({:.2} ticks)",
            note.loop_name,
            note.voice,
            note.note,
            note.tick,
            note.duration
        ),
        SessionEvent::Transport { tick, time, bpm } => {
            log::trace!("tick {:.2} time {:.2}s bpm {}", tick, time, bpm)
        }
        SessionEvent::Underrun { input } => log::debug!("{} underrun", input),
        _ => {}
    }
}

fn check_file(file: &Path, engine: &EngineArgs) -> Result<()> {
    let code = read_score(file)?;
    let config = engine.config()?;
    let result = validate_score(&code, &config);

    for error in result.all_errors() {
        let location = match (error.line, error.column) {
            (Some(line), Some(column)) => format!("{}:{}:{}", file.display(), line, column),
            (Some(line), None) => format!("{}:{}", file.display(), line),
            _ => file.display().to_string(),
        };
        match &error.node {
            Some(node) => eprintln!("error: {}: {}: {}", location, node, error.message),
            None => eprintln!("error: {}: {}", location, error.message),
        }
    }
    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }

    if let Some(structure) = &result.structure {
        print_structure(structure);
    }

    if !result.is_ok() {
        anyhow::bail!("{} error(s) in {}", result.all_errors().len(), file.display());
    }
    println!("ok");
    Ok(())
}

fn print_structure(structure: &ScoreStructure) {
    println!("bpm {} | sample rate {}", structure.bpm, structure.sample_rate);
    for entry in structure.loops.iter().chain(structure.filters.iter()) {
        let destination = match (&entry.out.kind, &entry.out.name) {
            (NodeKind::Output, _) => "output".to_string(),
            (_, Some(name)) => format!("{} {}", entry.out.kind, name),
            (kind, None) => kind.to_string(),
        };
        println!("  {:<14} {:<16} -> {}", entry.kind.to_string(), entry.name, destination);
    }
}

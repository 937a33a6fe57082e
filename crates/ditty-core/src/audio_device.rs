//! Audio device enumeration and the native audio host.
//!
//! This module provides cross-platform output device discovery using the cpal
//! library, and [`CpalHost`], which pulls a [`RenderCallback`] from the
//! device's stream callback.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::error::{DittyError, Result};
use crate::runtime::{AudioHost, RenderCallback};

const COMMON_SAMPLE_RATES: [u32; 7] = [22050, 44100, 48000, 88200, 96000, 176400, 192000];

/// Information about an output device.
#[derive(Clone, Debug)]
pub struct AudioDeviceInfo {
    /// Device name (as reported by the system)
    pub name: String,
    pub max_output_channels: u32,
    /// Supported sample rates (sorted)
    pub sample_rates: Vec<u32>,
    pub is_default_output: bool,
}

/// Output settings for the native host.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioConfig {
    /// Output device name (None = default)
    pub device: Option<String>,
    /// Sample rate (None = use device default)
    pub sample_rate: Option<u32>,
    /// Number of output channels (None = use device default)
    pub channels: Option<u16>,
    /// Frames per device callback (None = let the backend decide)
    pub device_frames: Option<u32>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: None,
            channels: Some(2),
            device_frames: None,
        }
    }
}

impl AudioConfig {
    /// Create a new AudioConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output device.
    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    /// Set the sample rate.
    pub fn with_sample_rate(mut self, rate: Option<u32>) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the number of output channels.
    pub fn with_channels(mut self, channels: Option<u16>) -> Self {
        self.channels = channels;
        self
    }

    /// Set the preferred callback size.
    pub fn with_device_frames(mut self, frames: Option<u32>) -> Self {
        self.device_frames = frames;
        self
    }
}

fn audio_error(context: &str, err: impl std::fmt::Display) -> DittyError {
    DittyError::Audio(format!("{}: {}", context, err))
}

/// List all output devices.
///
/// Returns the devices with their channel counts and sample rates, default first.
pub fn list_audio_devices() -> Result<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();

    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();

    for device in host
        .output_devices()
        .map_err(|e| audio_error("enumerating devices", e))?
    {
        let name = match device.name() {
            Ok(n) => n,
            Err(_) => continue, // Skip devices we can't get a name for
        };

        let Ok(configs) = device.supported_output_configs() else {
            continue;
        };

        let mut max_output_channels = 0;
        let mut sample_rates: Vec<u32> = Vec::new();
        for config in configs {
            max_output_channels = max_output_channels.max(config.channels() as u32);
            let min = config.min_sample_rate();
            let max = config.max_sample_rate();
            for rate in COMMON_SAMPLE_RATES {
                if rate >= min && rate <= max && !sample_rates.contains(&rate) {
                    sample_rates.push(rate);
                }
            }
        }
        if max_output_channels == 0 {
            continue;
        }
        sample_rates.sort();

        let is_default_output = default_output_name
            .as_ref()
            .is_some_and(|default| default == &name);

        devices.push(AudioDeviceInfo {
            name,
            max_output_channels,
            sample_rates,
            is_default_output,
        });
    }

    // Sort: default device first, then by name
    devices.sort_by(|a, b| {
        b.is_default_output
            .cmp(&a.is_default_output)
            .then_with(|| a.name.cmp(&b.name))
    });

    Ok(devices)
}

/// Print a formatted list of output devices to stdout.
pub fn print_audio_devices() -> Result<()> {
    let devices = list_audio_devices()?;

    println!("Available Output Devices:");
    println!("=========================\n");

    if devices.is_empty() {
        println!("  No audio devices found.");
        return Ok(());
    }

    for device in devices {
        let marker = if device.is_default_output { " [default]" } else { "" };
        println!("  {}{}", device.name, marker);
        println!("    Channels:     {}", device.max_output_channels);
        if !device.sample_rates.is_empty() {
            let rates: Vec<String> = device.sample_rates.iter().map(|r| r.to_string()).collect();
            println!("    Sample rates: {}", rates.join(", "));
        }
        println!();
    }

    Ok(())
}

/// Plays a render callback on a cpal output stream.
pub struct CpalHost {
    device: cpal::Device,
    stream_config: cpal::StreamConfig,
    stream: Option<cpal::Stream>,
    running: bool,
}

impl CpalHost {
    /// Open the configured output device. No stream is created until `install`.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = match &config.device {
            Some(wanted) => host
                .output_devices()
                .map_err(|e| audio_error("enumerating devices", e))?
                .find(|d| d.name().map(|n| &n == wanted).unwrap_or(false))
                .ok_or_else(|| DittyError::Audio(format!("no output device named '{}'", wanted)))?,
            None => host
                .default_output_device()
                .ok_or_else(|| DittyError::Audio("no default output device".to_string()))?,
        };

        let default = device
            .default_output_config()
            .map_err(|e| audio_error("reading the device configuration", e))?;
        let stream_config = cpal::StreamConfig {
            channels: config.channels.unwrap_or_else(|| default.channels()),
            sample_rate: config.sample_rate.unwrap_or_else(|| default.sample_rate()),
            buffer_size: match config.device_frames {
                Some(frames) => cpal::BufferSize::Fixed(frames),
                None => cpal::BufferSize::Default,
            },
        };

        log::info!(
            "[AUDIO] output {} at {} Hz, {} channel(s)",
            device.name().unwrap_or_else(|_| "<unnamed>".to_string()),
            stream_config.sample_rate,
            stream_config.channels
        );

        Ok(Self {
            device,
            stream_config,
            stream: None,
            running: false,
        })
    }

    pub fn channels(&self) -> u16 {
        self.stream_config.channels
    }
}

impl AudioHost for CpalHost {
    fn install(&mut self, mut callback: RenderCallback) -> Result<()> {
        let channels = self.stream_config.channels.max(1) as usize;
        // allocated here, never in the callback
        let mut scratch = vec![0.0f32; scratch_frames(&self.stream_config.buffer_size) * 2];

        let stream = self
            .device
            .build_output_stream(
                &self.stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if channels == 2 {
                        callback.process(data);
                    } else {
                        render_channels(|stereo| callback.process(stereo), data, channels, &mut scratch);
                    }
                },
                |err| log::error!("[AUDIO] stream error: {}", err),
                None,
            )
            .map_err(|e| audio_error("building the output stream", e))?;

        // some backends start streams on creation
        let _ = stream.pause();
        self.stream = Some(stream);
        self.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| DittyError::Audio("no render callback installed".to_string()))?;
        stream.play().map_err(|e| audio_error("starting playback", e))?;
        self.running = true;
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.pause().map_err(|e| audio_error("pausing playback", e))?;
        }
        self.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn sample_rate(&self) -> Option<u32> {
        Some(self.stream_config.sample_rate)
    }
}

/// Stereo frames rendered per pass when the device isn't stereo.
const SCRATCH_FRAMES: u32 = 4096;

fn scratch_frames(buffer_size: &cpal::BufferSize) -> usize {
    match buffer_size {
        cpal::BufferSize::Fixed(frames) => (*frames).max(SCRATCH_FRAMES) as usize,
        cpal::BufferSize::Default => SCRATCH_FRAMES as usize,
    }
}

/// Render stereo into `scratch` and spread it over `channels` interleaved
/// channels. Mono gets the average; channels past the second are silent.
/// Blocks larger than `scratch` are rendered in several passes.
fn render_channels(
    mut render: impl FnMut(&mut [f32]) -> bool,
    data: &mut [f32],
    channels: usize,
    scratch: &mut [f32],
) {
    let chunk_frames = (scratch.len() / 2).max(1);
    for block in data.chunks_mut(chunk_frames * channels) {
        let frames = block.len() / channels;
        let stereo = &mut scratch[..frames * 2];
        render(stereo);
        for (frame, pair) in block.chunks_exact_mut(channels).zip(stereo.chunks_exact(2)) {
            if channels == 1 {
                frame[0] = 0.5 * (pair[0] + pair[1]);
            } else {
                frame[0] = pair[0];
                frame[1] = pair[1];
                frame[2..].fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_config_default() {
        let config = AudioConfig::default();
        assert!(config.device.is_none());
        assert!(config.sample_rate.is_none());
        assert_eq!(config.channels, Some(2));
        assert!(config.device_frames.is_none());
    }

    #[test]
    fn test_audio_config_builder() {
        let config = AudioConfig::new()
            .with_device(Some("hw:1".to_string()))
            .with_sample_rate(Some(48000))
            .with_channels(Some(6))
            .with_device_frames(Some(128));

        assert_eq!(config.device, Some("hw:1".to_string()));
        assert_eq!(config.sample_rate, Some(48000));
        assert_eq!(config.channels, Some(6));
        assert_eq!(config.device_frames, Some(128));
    }

    #[test]
    fn test_scratch_covers_fixed_blocks() {
        assert_eq!(scratch_frames(&cpal::BufferSize::Default), 4096);
        assert_eq!(scratch_frames(&cpal::BufferSize::Fixed(128)), 4096);
        assert_eq!(scratch_frames(&cpal::BufferSize::Fixed(8192)), 8192);
    }

    #[test]
    fn test_render_channels_in_passes() {
        let mut scratch = vec![0.0f32; 8];
        let mut passes = 0;
        // four frames of scratch against ten frames of quad output
        let mut data = vec![9.0f32; 40];
        render_channels(
            |stereo| {
                passes += 1;
                for pair in stereo.chunks_exact_mut(2) {
                    pair[0] = 0.25;
                    pair[1] = 0.75;
                }
                true
            },
            &mut data,
            4,
            &mut scratch,
        );
        assert_eq!(passes, 3);
        assert_eq!(scratch.len(), 8);
        for frame in data.chunks_exact(4) {
            assert_eq!(frame, &[0.25, 0.75, 0.0, 0.0]);
        }

        let mut mono = vec![0.0f32; 3];
        render_channels(
            |stereo| {
                stereo.fill(0.5);
                stereo[0] = 1.0;
                true
            },
            &mut mono,
            1,
            &mut scratch,
        );
        assert_eq!(mono, vec![0.75, 0.5, 0.5]);
    }
}

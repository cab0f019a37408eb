//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Stream, StreamConfig};

use super::chunker::Chunker;
use crate::{Error, Result};

/// Rate assumed when a device reports something unusable
const FALLBACK_SAMPLE_RATE: u32 = 16000;

/// Lowest native rate accepted from a device
const MIN_SAMPLE_RATE: u32 = 8000;

/// Summary of an audio device for the `devices` command
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub input_channels: u16,
    pub sample_rate: u32,
}

/// Captures audio from the preferred input device
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Open the preferred input device
    ///
    /// Prefers the system default input; falls back to the first device that
    /// exposes input channels.
    ///
    /// # Errors
    ///
    /// Returns error if no input device is available
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();

        let default = host.default_input_device().and_then(|d| {
            let config = d.default_input_config().ok()?;
            (config.channels() > 0).then_some((d, config))
        });

        let (device, supported) = match default {
            Some(found) => found,
            None => host
                .input_devices()
                .map_err(|e| Error::Audio(e.to_string()))?
                .find_map(|d| {
                    let config = d.default_input_config().ok()?;
                    (config.channels() > 0).then_some((d, config))
                })
                .ok_or_else(|| Error::Audio("no microphone found".to_string()))?,
        };

        let mut config = supported.config();
        if config.sample_rate.0 < MIN_SAMPLE_RATE {
            config.sample_rate = cpal::SampleRate(FALLBACK_SAMPLE_RATE);
        }

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }

    /// Start feeding captured frames into `chunker`
    ///
    /// Requests a driver buffer of `chunk_ms` and falls back to the driver
    /// default if the device refuses it.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn start(&mut self, chunker: Chunker, chunk_ms: u32) -> Result<()> {
        let channels = usize::from(self.config.channels);
        self.start_with(Some(chunk_ms), move |data| chunker.process(data, channels))
    }

    /// Start capturing with a custom frame callback
    ///
    /// The callback runs on the driver thread and must not block.
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start_with<F>(&mut self, chunk_ms: Option<u32>, on_frame: F) -> Result<()>
    where
        F: FnMut(&[f32]) + Send + Clone + 'static,
    {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = match chunk_ms {
            Some(ms) => {
                let mut fixed = self.config.clone();
                fixed.buffer_size = BufferSize::Fixed(self.config.sample_rate.0 * ms / 1000);
                self.build(&fixed, on_frame.clone()).or_else(|e| {
                    tracing::debug!(error = %e, "fixed capture buffer refused, using driver default");
                    self.build(&self.config, on_frame)
                })?
            }
            None => self.build(&self.config, on_frame)?,
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn build<F>(&self, config: &StreamConfig, mut on_frame: F) -> Result<Stream>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        self.device
            .build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| on_frame(data),
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Native sample rate of the capture stream
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Interleaved channel count of the capture stream
    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.config.channels
    }

    /// Device name, if the driver reports one
    #[must_use]
    pub fn device_name(&self) -> String {
        self.device.name().unwrap_or_default()
    }
}

/// List input-capable devices of the default host
///
/// # Errors
///
/// Returns error if devices cannot be enumerated
pub fn list_input_devices() -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = host
        .input_devices()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter_map(|d| {
            let config = d.default_input_config().ok()?;
            let name = d.name().unwrap_or_default();
            Some(DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                input_channels: config.channels(),
                sample_rate: config.sample_rate().0,
            })
        })
        .collect();

    Ok(devices)
}

/// RMS level of a block of samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

//! Audio playback to speakers
//!
//! Output streams are 16-bit mono PCM pushed incrementally as it arrives from
//! the TTS service. cpal streams are not `Send`, so each open stream lives on
//! its own thread and is fed through a shared sample queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Buffered audio beyond which `write` blocks, in milliseconds
const MAX_BUFFERED_MS: u32 = 500;

/// Extra time allowed for the device to drain on close
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// A writable PCM output stream
pub trait PcmStream: Send {
    /// Queue samples for playback, blocking while the device is behind
    ///
    /// # Errors
    ///
    /// Returns error if the device stream has failed
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Let queued audio play out, then stop and release the device
    ///
    /// # Errors
    ///
    /// Returns error if the stream could not be shut down cleanly
    fn close(&mut self) -> Result<()>;
}

/// Opens PCM output streams
pub trait AudioOutput: Send + Sync {
    /// Open a mono 16-bit stream at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns error if no suitable output device is available
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PcmStream>>;
}

/// Async wrapper that runs every blocking write on the blocking pool
#[derive(Clone)]
pub struct BlockingPcm {
    inner: Arc<Mutex<Box<dyn PcmStream>>>,
}

impl BlockingPcm {
    #[must_use]
    pub fn new(stream: Box<dyn PcmStream>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stream)),
        }
    }

    /// Write samples without stalling the async scheduler
    ///
    /// # Errors
    ///
    /// Returns error if the device write fails
    pub async fn write(&self, samples: Vec<i16>) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner
                .lock()
                .map_err(|_| Error::Audio("output stream lock poisoned".to_string()))?
                .write(&samples)
        })
        .await
        .map_err(|e| Error::Audio(format!("playback write task failed: {e}")))?
    }

    /// Drain and close the stream
    ///
    /// # Errors
    ///
    /// Returns error if the stream could not be closed
    pub async fn close(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner
                .lock()
                .map_err(|_| Error::Audio("output stream lock poisoned".to_string()))?
                .close()
        })
        .await
        .map_err(|e| Error::Audio(format!("playback close task failed: {e}")))?
    }
}

/// Plays audio on the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioPlayback;

impl AudioOutput for AudioPlayback {
    fn open(&self, sample_rate: u32) -> Result<Box<dyn PcmStream>> {
        Ok(Box::new(DeviceStream::open(sample_rate)?))
    }
}

/// One open device stream hosted on a dedicated thread
struct DeviceStream {
    queue: Arc<Mutex<VecDeque<i16>>>,
    sample_rate: u32,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceStream {
    fn open(sample_rate: u32) -> Result<Self> {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_queue = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name("talkback-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(sample_rate, thread_queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::Audio(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until close() or drop
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Audio("playback thread exited during setup".to_string()))??;

        tracing::debug!(sample_rate, "output stream opened");

        Ok(Self {
            queue,
            sample_rate,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn buffered(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("playback thread panicked");
            }
        }
    }
}

impl PcmStream for DeviceStream {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        if self.thread.as_ref().is_none_or(JoinHandle::is_finished) {
            return Err(Error::Audio("output stream is closed".to_string()));
        }

        self.queue
            .lock()
            .map_err(|_| Error::Audio("output queue lock poisoned".to_string()))?
            .extend(samples.iter().copied());

        let limit = (self.sample_rate * MAX_BUFFERED_MS / 1000) as usize;
        let thread = self.thread.as_ref();
        wait_for_room(&self.queue, limit, self.sample_rate, DRAIN_GRACE, || {
            thread.is_some_and(|t| !t.is_finished())
        })
    }

    fn close(&mut self) -> Result<()> {
        if self.thread.is_none() {
            return Ok(());
        }

        let remaining = self.buffered() as u64;
        let deadline = Instant::now()
            + Duration::from_millis(remaining * 1000 / u64::from(self.sample_rate.max(1)))
            + DRAIN_GRACE;

        while self.buffered() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }

        // Small delay so the device plays its last period
        std::thread::sleep(Duration::from_millis(100));

        self.shutdown();
        tracing::debug!("output stream closed");
        Ok(())
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Block until at most `limit` samples are queued
///
/// The deadline is the queued duration plus `grace`, restarted whenever the
/// queue shrinks. A device that stops pulling samples without tearing down
/// its thread would otherwise block the writer forever.
fn wait_for_room(
    queue: &Mutex<VecDeque<i16>>,
    limit: usize,
    sample_rate: u32,
    grace: Duration,
    alive: impl Fn() -> bool,
) -> Result<()> {
    let buffered = || queue.lock().map(|q| q.len()).unwrap_or(0);
    let deadline_for = |queued: usize| {
        Instant::now()
            + Duration::from_millis(queued as u64 * 1000 / u64::from(sample_rate.max(1)))
            + grace
    };

    let mut last = buffered();
    let mut deadline = deadline_for(last);

    while last > limit {
        if !alive() {
            return Err(Error::Audio("output stream stopped while writing".to_string()));
        }
        if Instant::now() >= deadline {
            tracing::warn!(buffered = last, "output stalled, giving up on write");
            return Err(Error::Audio("output stalled".to_string()));
        }

        std::thread::sleep(Duration::from_millis(10));

        let now = buffered();
        if now < last {
            deadline = deadline_for(now);
        }
        last = now;
    }
    Ok(())
}

/// Build a cpal output stream pulling from `queue`
///
/// Prefers a mono config at `sample_rate`; falls back to stereo with the
/// sample duplicated on both channels.
fn build_output_stream(sample_rate: u32, queue: Arc<Mutex<VecDeque<i16>>>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .or_else(|| {
            // Fallback: try stereo
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    let config: StreamConfig = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate,
        channels,
        "audio playback initialized"
    );

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))
}

/// Convert little-endian 16-bit PCM bytes to samples
///
/// A trailing odd byte is ignored.
#[must_use]
pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Generate a sine tone as 16-bit samples
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn sine_tone(frequency: f32, duration: Duration, sample_rate: u32, amplitude: f32) -> Vec<i16> {
    let count = (duration.as_secs_f32() * sample_rate as f32) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin() * 32767.0) as i16
        })
        .collect()
}

//! Resample captured frames to the STT format and gate them on `armed`

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::state::Shared;

/// One chunk of 16-bit signed little-endian mono PCM at the STT rate
pub type AudioChunk = Vec<u8>;

/// Converts driver frames to STT chunks
///
/// Runs on the audio driver thread, so `process` never blocks: it resamples,
/// quantizes and pushes onto an unbounded queue.
#[derive(Clone)]
pub struct Chunker {
    source_rate: u32,
    target_rate: u32,
    shared: Arc<Shared>,
    out: mpsc::UnboundedSender<AudioChunk>,
}

impl Chunker {
    #[must_use]
    pub const fn new(
        source_rate: u32,
        target_rate: u32,
        shared: Arc<Shared>,
        out: mpsc::UnboundedSender<AudioChunk>,
    ) -> Self {
        Self {
            source_rate,
            target_rate,
            shared,
            out,
        }
    }

    /// Handle one interleaved frame with `channels` channels
    ///
    /// Only channel 0 is used. One frame produces at most one chunk.
    pub fn process(&self, interleaved: &[f32], channels: usize) {
        if !self.shared.flags.is_armed() || interleaved.is_empty() {
            return;
        }

        let mono: Vec<f32> = interleaved.iter().step_by(channels.max(1)).copied().collect();
        let resampled = resample_linear(&mono, self.source_rate, self.target_rate);
        let chunk = to_pcm16(&resampled);

        if self.out.send(chunk).is_err() {
            tracing::trace!("audio queue closed, dropping frame");
        }
    }
}

/// Linearly resample `samples` from `src` Hz to `dst` Hz
///
/// Input sample `i` sits at `i / src` seconds; output sample `j` at
/// `j * duration / m` where `m = round(duration * dst)` (at least 1). Points
/// past the last input sample hold its value.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn resample_linear(samples: &[f32], src: u32, dst: u32) -> Vec<f32> {
    if src == dst || samples.is_empty() {
        return samples.to_vec();
    }

    let n = samples.len();
    let duration = n as f64 / f64::from(src);
    let m = ((duration * f64::from(dst)).round() as usize).max(1);
    let step = n as f64 / m as f64;
    let last = n - 1;

    (0..m)
        .map(|j| {
            let pos = j as f64 * step;
            let i = pos.floor() as usize;
            if i >= last {
                return samples[last];
            }
            let frac = (pos - i as f64) as f32;
            samples[i].mul_add(1.0 - frac, samples[i + 1] * frac)
        })
        .collect()
}

/// Clamp to [-1, 1] and quantize to little-endian 16-bit PCM bytes
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| ((s.clamp(-1.0, 1.0) * 32767.0) as i16).to_le_bytes())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_passthrough() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16000, 16000), samples);
    }

    #[test]
    fn downsample_length_follows_duration() {
        // 10 ms at 48 kHz -> 10 ms at 16 kHz
        let samples = vec![0.0f32; 480];
        assert_eq!(resample_linear(&samples, 48000, 16000).len(), 160);
    }

    #[test]
    fn downsample_picks_grid_points() {
        let samples: Vec<f32> = (0u8..6).map(f32::from).collect();
        // step of 3 input samples per output sample
        assert_eq!(resample_linear(&samples, 48000, 16000), vec![0.0, 3.0]);
    }

    #[test]
    fn upsample_interpolates_and_holds_tail() {
        let samples = vec![0.0, 1.0];
        let out = resample_linear(&samples, 8000, 16000);
        assert_eq!(out.len(), 4);
        assert!((out[0] - 0.0).abs() < 1e-6);
        assert!((out[1] - 0.5).abs() < 1e-6);
        assert!((out[2] - 1.0).abs() < 1e-6);
        assert!((out[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn tiny_frame_yields_one_sample() {
        assert_eq!(resample_linear(&[0.5], 48000, 16000).len(), 1);
    }

    #[test]
    fn quantize_clamps() {
        let bytes = to_pcm16(&[2.0, -2.0, 0.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), 32767);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), -32767);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), 0);
    }

    #[test]
    fn unarmed_frames_are_dropped() {
        let shared = Arc::new(Shared::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunker = Chunker::new(16000, 16000, Arc::clone(&shared), tx);

        chunker.process(&[0.1; 160], 1);
        assert!(rx.try_recv().is_err());

        shared.flags.set_armed(true);
        chunker.process(&[0.1; 160], 1);
        assert_eq!(rx.try_recv().unwrap().len(), 320);
    }

    #[test]
    fn uses_first_channel_only() {
        let shared = Arc::new(Shared::new());
        shared.flags.set_armed(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let chunker = Chunker::new(16000, 16000, shared, tx);

        // left = 0.5, right = -0.5
        chunker.process(&[0.5, -0.5, 0.5, -0.5], 2);
        let chunk = rx.try_recv().unwrap();
        assert_eq!(chunk.len(), 4);
        assert!(i16::from_le_bytes([chunk[0], chunk[1]]) > 0);
        assert!(i16::from_le_bytes([chunk[2], chunk[3]]) > 0);
    }
}

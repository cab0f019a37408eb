//! Streaming text-to-speech playback
//!
//! Each reply gets its own synthesis connection. Audio frames are played as
//! they arrive, and can optionally be recorded to a WAV file.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Local};
use futures::{SinkExt, Stream, StreamExt};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::playback::{AudioOutput, BlockingPcm, pcm16_from_bytes};
use super::stt::authorized_request;
use crate::config::{TtsConfig, VoiceSettings};
use crate::pipeline::Speaker;
use crate::{Error, Result};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Build the `stream-input` URL for the configured voice
///
/// # Errors
///
/// Returns error if the configured endpoint is not a valid URL
pub fn build_stream_url(config: &TtsConfig) -> Result<Url> {
    let base = format!(
        "{}/{}/stream-input",
        config.endpoint.trim_end_matches('/'),
        config.voice_id
    );
    let mut url = Url::parse(&base)
        .map_err(|e| Error::Config(format!("invalid TTS endpoint {base:?}: {e}")))?;

    url.query_pairs_mut()
        .append_pair("model_id", &config.model_id)
        .append_pair("output_format", &format!("pcm_{}", config.sample_rate))
        .append_pair("auto_mode", if config.auto_mode { "true" } else { "false" });

    Ok(url)
}

/// Outbound messages for one reply: priming, text, end of input
#[must_use]
pub fn request_messages(text: &str, voice_settings: &VoiceSettings) -> Vec<String> {
    vec![
        serde_json::json!({ "text": " ", "voice_settings": voice_settings }).to_string(),
        serde_json::json!({ "text": text, "try_trigger_generation": true }).to_string(),
        serde_json::json!({ "text": "" }).to_string(),
    ]
}

#[derive(Deserialize)]
struct TtsEvent {
    audio: Option<String>,
    #[serde(rename = "isFinal")]
    is_final: Option<bool>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Classified inbound TTS message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsFrame {
    /// Base64-encoded PCM
    Audio(String),
    /// Synthesis finished
    Final,
    /// Anything else (alignment data, warnings)
    Other,
}

/// Classify one inbound TTS message
///
/// # Errors
///
/// Returns `Error::Protocol` if the payload is not JSON
pub fn parse_tts_event(raw: &str) -> Result<TtsFrame> {
    let event: TtsEvent = serde_json::from_str(raw).map_err(|e| Error::Protocol(e.to_string()))?;

    if event.is_final == Some(true) || event.kind.as_deref() == Some("finalOutput") {
        return Ok(TtsFrame::Final);
    }

    Ok(match event.audio {
        Some(audio) if !audio.is_empty() => TtsFrame::Audio(audio),
        _ => TtsFrame::Other,
    })
}

/// WAV file writer that stops accepting samples at a duration cap
pub struct WavRecorder {
    writer: hound::WavWriter<BufWriter<File>>,
    path: PathBuf,
    remaining: u64,
}

impl WavRecorder {
    /// Create `<dir>/session_YYYYmmdd_HHMMSS.wav`
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be created
    pub fn create(
        dir: &Path,
        sample_rate: u32,
        max_secs: u32,
        now: DateTime<Local>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("session_{}.wav", now.format("%Y%m%d_%H%M%S")));

        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)?;

        tracing::debug!(path = %path.display(), "recording TTS reply");
        Ok(Self {
            writer,
            path,
            remaining: u64::from(sample_rate) * u64::from(max_secs),
        })
    }

    /// Append samples up to the cap; the rest is dropped
    ///
    /// # Errors
    ///
    /// Returns error if the file write fails
    pub fn write(&mut self, samples: &[i16]) -> Result<()> {
        let take = usize::try_from(self.remaining).map_or(samples.len(), |r| r.min(samples.len()));
        for &sample in &samples[..take] {
            self.writer.write_sample(sample)?;
        }
        self.remaining -= take as u64;
        Ok(())
    }

    /// Finalize the header and return the file path
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be finalized
    pub fn finish(self) -> Result<PathBuf> {
        self.writer.finalize()?;
        Ok(self.path)
    }
}

/// Play inbound TTS messages until the final marker or end of stream
///
/// Returns the number of samples written to `output`.
///
/// # Errors
///
/// Returns error if the stream fails or the device rejects a write
pub async fn play_events<S>(
    stream: &mut S,
    output: &BlockingPcm,
    mut recorder: Option<&mut WavRecorder>,
) -> Result<u64>
where
    S: Stream<Item = Result<Message>> + Unpin,
{
    let mut played = 0u64;

    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let audio = match parse_tts_event(text.as_str()) {
            Ok(TtsFrame::Final) => {
                tracing::debug!("TTS final output received");
                break;
            }
            Ok(TtsFrame::Audio(audio)) => audio,
            Ok(TtsFrame::Other) => continue,
            Err(e) => {
                tracing::trace!(error = %e, "ignoring non-JSON TTS frame");
                continue;
            }
        };

        let bytes = match BASE64.decode(audio.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "TTS audio decode failed");
                continue;
            }
        };

        let samples = pcm16_from_bytes(&bytes);
        if let Some(recorder) = recorder.as_deref_mut() {
            if let Err(e) = recorder.write(&samples) {
                tracing::warn!(error = %e, "TTS recording write failed");
            }
        }

        played += samples.len() as u64;
        output.write(samples).await?;
    }

    Ok(played)
}

/// `ElevenLabs` streaming synthesis client
pub struct TtsClient {
    config: TtsConfig,
    output_dir: PathBuf,
    output: Arc<dyn AudioOutput>,
}

impl TtsClient {
    #[must_use]
    pub fn new(config: TtsConfig, output_dir: PathBuf, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            config,
            output_dir,
            output,
        }
    }

    async fn stream_reply(
        &self,
        text: &str,
        output: &BlockingPcm,
        recorder: Option<&mut WavRecorder>,
    ) -> Result<u64> {
        let key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("ELEVENLABS_API_KEY not set".to_string()))?;
        let url = build_stream_url(&self.config)?;
        let request = authorized_request(&url, "xi-api-key", key.expose_secret())?;

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Connection(format!("TTS handshake failed: {e}")))?;
        let (mut sink, stream) = ws.split();

        for message in request_messages(text, &self.config.voice_settings) {
            sink.send(Message::text(message))
                .await
                .map_err(|e| Error::Connection(format!("TTS send failed: {e}")))?;
        }

        let mut stream = stream.map(|msg| msg.map_err(Error::from));
        let played = play_events(&mut stream, output, recorder).await;

        if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
            tracing::debug!("TTS close handshake timed out");
        }
        played
    }
}

#[async_trait]
impl Speaker for TtsClient {
    /// Synthesize `text` and play it as it streams in
    ///
    /// The output device is opened before any network activity. It is
    /// drained and closed on every exit path, as is the recording.
    async fn speak(&self, text: &str) -> Result<Option<PathBuf>> {
        if text.trim().is_empty() {
            return Err(Error::EmptyText);
        }
        if self.config.api_key.is_none() {
            return Err(Error::Config("ELEVENLABS_API_KEY not set".to_string()));
        }

        let mut recorder = if self.config.save_wav {
            Some(WavRecorder::create(
                &self.output_dir,
                self.config.sample_rate,
                self.config.max_wav_secs,
                Local::now(),
            )?)
        } else {
            None
        };

        let output = BlockingPcm::new(self.output.open(self.config.sample_rate)?);
        let result = self.stream_reply(text, &output, recorder.as_mut()).await;

        if let Err(e) = output.close().await {
            tracing::warn!(error = %e, "failed to close output stream");
        }

        let saved = recorder.and_then(|recorder| match recorder.finish() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "failed to finalize TTS recording");
                None
            }
        });

        let played = result?;
        tracing::debug!(samples = played, "TTS playback finished");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_parameters() {
        let url = build_stream_url(&TtsConfig::default()).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://api.elevenlabs.io/v1/text-to-speech/nPczCjzI2devNBz1zQrb/stream-input\
             ?model_id=eleven_flash_v2_5&output_format=pcm_16000&auto_mode=true"
        );
    }

    #[test]
    fn request_messages_in_order() {
        let messages = request_messages("Hi there", &VoiceSettings::default());
        assert_eq!(messages.len(), 3);

        let priming: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(priming["text"], " ");
        assert_eq!(priming["voice_settings"]["use_speaker_boost"], true);

        let body: serde_json::Value = serde_json::from_str(&messages[1]).unwrap();
        assert_eq!(body["text"], "Hi there");
        assert_eq!(body["try_trigger_generation"], true);

        assert_eq!(messages[2], r#"{"text":""}"#);
    }

    #[test]
    fn classifies_events() {
        assert_eq!(parse_tts_event(r#"{"isFinal":true}"#).unwrap(), TtsFrame::Final);
        assert_eq!(
            parse_tts_event(r#"{"type":"finalOutput"}"#).unwrap(),
            TtsFrame::Final
        );
        assert_eq!(
            parse_tts_event(r#"{"audio":"AAA=","isFinal":null}"#).unwrap(),
            TtsFrame::Audio("AAA=".to_string())
        );
        assert_eq!(
            parse_tts_event(r#"{"audio":null,"alignment":{}}"#).unwrap(),
            TtsFrame::Other
        );
        assert!(parse_tts_event("binary junk").is_err());
    }

    #[test]
    fn recorder_respects_cap() {
        let dir = tempfile::tempdir().unwrap();
        // 1 second cap at 8 Hz keeps 8 samples
        let mut recorder = WavRecorder::create(dir.path(), 8, 1, Local::now()).unwrap();
        recorder.write(&[1; 5]).unwrap();
        recorder.write(&[2; 5]).unwrap();
        let path = recorder.finish().unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().starts_with("session_"));
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len(), 8);
    }
}

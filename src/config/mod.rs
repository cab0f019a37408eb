//! Configuration management for talkback
//!
//! Values are layered: built-in defaults, then the optional TOML file, then
//! environment variables. The CLI applies its own overrides last.

pub mod file;

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Serialize;

use crate::{Error, Result};
use file::TalkbackConfigFile;

/// Talkback configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Streaming speech-to-text
    pub stt: SttConfig,

    /// Streaming text-to-speech
    pub tts: TtsConfig,

    /// Language model
    pub llm: LlmConfig,

    /// Push-to-talk key and debounce windows
    pub keys: KeyConfig,

    /// Finalization timing
    pub flush: FlushConfig,

    /// Worker pool
    pub pipeline: PipelineConfig,

    /// Output paths
    pub output: OutputConfig,
}

/// Streaming STT configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Deepgram API key
    pub api_key: Option<SecretString>,

    /// Streaming listen endpoint
    pub endpoint: String,

    /// Model identifier (e.g. "nova-3")
    pub model: String,

    /// Language tag (e.g. "en-US")
    pub language: String,

    /// Ask the service to punctuate
    pub punctuate: bool,

    /// Ask the service to format numbers, dates, etc
    pub smart_format: bool,

    /// Target sample rate of the PCM stream
    pub sample_rate: u32,

    /// Channel count of the PCM stream
    pub channels: u16,

    /// Duration of one transmitted sub-frame in milliseconds
    pub chunk_ms: u32,

    /// Fraction of the sub-frame duration slept between sends
    pub pacing_factor: f64,

    /// Backlog (queued chunks) that suspends pacing
    pub high_water: usize,

    /// Backlog at which pacing resumes
    pub low_water: usize,

    /// Reconnect delays; the last entry repeats
    pub backoff: Vec<Duration>,

    /// Largest inbound message accepted from the service
    pub max_message_size: usize,

    /// Render partial transcripts on stderr
    pub show_partials: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-3".to_string(),
            language: "en-US".to_string(),
            punctuate: true,
            smart_format: true,
            sample_rate: 16000,
            channels: 1,
            chunk_ms: 40,
            pacing_factor: 0.8,
            high_water: 12,
            low_water: 4,
            backoff: vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            max_message_size: 10_000_000,
            show_partials: true,
        }
    }
}

/// Voice settings sent to the TTS service in the priming message
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VoiceSettings {
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.3,
            similarity_boost: 0.7,
            style: 0.0,
            use_speaker_boost: true,
        }
    }
}

/// Streaming TTS configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// `ElevenLabs` API key
    pub api_key: Option<SecretString>,

    /// Base URL; the voice id and `stream-input` are appended
    pub endpoint: String,

    /// Voice identifier
    pub voice_id: String,

    /// Model identifier
    pub model_id: String,

    /// Output sample rate (requested as `pcm_<rate>`)
    pub sample_rate: u32,

    /// Let the service segment text on its own
    pub auto_mode: bool,

    /// Priming voice settings
    pub voice_settings: VoiceSettings,

    /// Record replies to WAV files
    pub save_wav: bool,

    /// Maximum recorded duration per reply, in seconds
    pub max_wav_secs: u32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "wss://api.elevenlabs.io/v1/text-to-speech".to_string(),
            voice_id: "nPczCjzI2devNBz1zQrb".to_string(),
            model_id: "eleven_flash_v2_5".to_string(),
            sample_rate: 16000,
            auto_mode: true,
            voice_settings: VoiceSettings::default(),
            save_wav: false,
            max_wav_secs: 300,
        }
    }
}

/// LLM configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Gemini API key
    pub api_key: Option<SecretString>,

    /// Base URL of the models collection
    pub endpoint: String,

    /// Model identifier
    pub model: String,

    /// Output token budget
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Instruction prepended to every utterance
    pub system_instruction: String,

    /// Request timeout
    pub timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            model: "gemini-1.5-flash".to_string(),
            max_tokens: 16,
            temperature: 0.2,
            system_instruction: "Answer briefly (1–2 sentences).".to_string(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Push-to-talk key configuration
#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// Key name (see `voice::keys::parse_key`)
    pub key: String,

    /// Key level poll interval
    pub poll_interval: Duration,

    /// How long a press must hold before recording starts
    pub press_debounce: Duration,

    /// How long a release must hold before recording stops
    pub release_debounce: Duration,

    /// How long the key must stay up after playback before re-arming
    pub keyup_confirm: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            key: "space".to_string(),
            poll_interval: Duration::from_millis(10),
            press_debounce: Duration::from_millis(50),
            release_debounce: Duration::from_millis(30),
            keyup_confirm: Duration::from_millis(60),
        }
    }
}

/// Finalization timing
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// How often the last-final timestamp is checked
    pub poll_interval: Duration,

    /// Quiet period after the last final that ends the wait
    pub idle: Duration,

    /// Upper bound on the wait, measured from the flush request
    pub hard_timeout: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
            idle: Duration::from_millis(90),
            hard_timeout: Duration::from_millis(600),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of LLM/TTS workers; 1 keeps replies in utterance order
    pub workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

/// Output paths
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Transcript log file
    pub transcript_file: PathBuf,

    /// Directory for recorded TTS replies
    pub tts_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            transcript_file: PathBuf::from("transcripts.txt"),
            tts_dir: PathBuf::from("tts_outputs"),
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load() -> Result<Self> {
        Self::load_with(file::load_config_file(), |name| std::env::var(name).ok())
    }

    /// Build configuration from a file overlay and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resulting configuration is invalid
    pub fn load_with(
        file: TalkbackConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::default();
        config.apply_file(file);
        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: TalkbackConfigFile) {
        let TalkbackConfigFile {
            stt,
            tts,
            llm,
            keys,
            flush,
            pipeline,
            output,
        } = file;

        set_secret(&mut self.stt.api_key, stt.api_key);
        set(&mut self.stt.endpoint, stt.endpoint);
        set(&mut self.stt.model, stt.model);
        set(&mut self.stt.language, stt.language);
        set(&mut self.stt.punctuate, stt.punctuate);
        set(&mut self.stt.smart_format, stt.smart_format);
        set(&mut self.stt.chunk_ms, stt.chunk_ms);
        set(&mut self.stt.high_water, stt.high_water);
        set(&mut self.stt.low_water, stt.low_water);
        set(&mut self.stt.show_partials, stt.show_partials);

        set_secret(&mut self.tts.api_key, tts.api_key);
        set(&mut self.tts.endpoint, tts.endpoint);
        set(&mut self.tts.voice_id, tts.voice_id);
        set(&mut self.tts.model_id, tts.model_id);
        set(&mut self.tts.save_wav, tts.save_wav);
        set(&mut self.tts.max_wav_secs, tts.max_wav_secs);

        set_secret(&mut self.llm.api_key, llm.api_key);
        set(&mut self.llm.endpoint, llm.endpoint);
        set(&mut self.llm.model, llm.model);
        set(&mut self.llm.max_tokens, llm.max_tokens);
        set(&mut self.llm.temperature, llm.temperature);
        set(&mut self.llm.system_instruction, llm.system_instruction);

        set(&mut self.keys.key, keys.key);
        set_millis(&mut self.keys.press_debounce, keys.press_debounce_ms);
        set_millis(&mut self.keys.release_debounce, keys.release_debounce_ms);
        set_millis(&mut self.keys.keyup_confirm, keys.keyup_confirm_ms);

        set_millis(&mut self.flush.idle, flush.idle_ms);
        set_millis(&mut self.flush.hard_timeout, flush.hard_timeout_ms);

        set(&mut self.pipeline.workers, pipeline.workers);

        set(&mut self.output.transcript_file, output.transcript_file.map(PathBuf::from));
        set(&mut self.output.tts_dir, output.tts_dir.map(PathBuf::from));
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        set_secret(
            &mut self.stt.api_key,
            env("DEEPGRAM_API_KEY").or_else(|| env("DG_API_KEY")),
        );
        set(&mut self.stt.model, env("TALKBACK_STT_MODEL"));
        set(&mut self.stt.language, env("TALKBACK_LANGUAGE"));
        set(&mut self.stt.show_partials, env("TALKBACK_SHOW_PARTIALS").map(|v| is_truthy(&v)));

        set_secret(&mut self.tts.api_key, env("ELEVENLABS_API_KEY"));
        set(&mut self.tts.voice_id, env("ELEVEN_VOICE_ID"));
        set(&mut self.tts.model_id, env("ELEVEN_MODEL_ID"));

        set_secret(&mut self.llm.api_key, env("GEMINI_API_KEY"));
        set(&mut self.llm.model, env("GEMINI_MODEL"));
        set(&mut self.llm.max_tokens, parsed(env, "GEMINI_MAX_TOKENS"));
        set(&mut self.llm.temperature, parsed(env, "GEMINI_TEMPERATURE"));

        set(&mut self.keys.key, env("TALKBACK_KEY"));
        set(&mut self.pipeline.workers, parsed(env, "N_WORKERS"));

        set(&mut self.output.transcript_file, env("TALKBACK_TRANSCRIPT_FILE").map(PathBuf::from));
        set(&mut self.output.tts_dir, env("TALKBACK_TTS_DIR").map(PathBuf::from));
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violated constraint
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            return Err(Error::Config("pipeline.workers must be at least 1".to_string()));
        }
        if self.stt.chunk_ms == 0 {
            return Err(Error::Config("stt.chunk_ms must be positive".to_string()));
        }
        if self.stt.low_water >= self.stt.high_water {
            return Err(Error::Config(format!(
                "stt.low_water ({}) must be below stt.high_water ({})",
                self.stt.low_water, self.stt.high_water
            )));
        }
        if self.stt.backoff.is_empty() {
            return Err(Error::Config("stt.backoff must not be empty".to_string()));
        }
        if self.flush.idle > self.flush.hard_timeout {
            return Err(Error::Config(
                "flush.idle must not exceed flush.hard_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn set_secret(slot: &mut Option<SecretString>, value: Option<String>) {
    if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
        *slot = Some(SecretString::from(v));
    }
}

fn set_millis(slot: &mut Duration, value: Option<u64>) {
    set(slot, value.map(Duration::from_millis));
}

fn parsed<T: FromStr>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = env(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

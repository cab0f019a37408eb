//! TOML configuration file loading
//!
//! Supports `~/.config/talkback/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TalkbackConfigFile {
    /// Speech-to-text configuration
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text-to-speech configuration
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Push-to-talk key configuration
    #[serde(default)]
    pub keys: KeysFileConfig,

    /// Flush timing configuration
    #[serde(default)]
    pub flush: FlushFileConfig,

    /// Worker pool configuration
    #[serde(default)]
    pub pipeline: PipelineFileConfig,

    /// Output paths
    #[serde(default)]
    pub output: OutputFileConfig,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    /// Model identifier (e.g. "nova-3")
    pub model: Option<String>,
    /// BCP-47 language tag (e.g. "en-US")
    pub language: Option<String>,
    pub punctuate: Option<bool>,
    pub smart_format: Option<bool>,
    /// Sub-frame duration in milliseconds
    pub chunk_ms: Option<u32>,
    /// Backlog that switches the sender into catch-up mode
    pub high_water: Option<usize>,
    /// Backlog that switches the sender back to paced mode
    pub low_water: Option<usize>,
    pub show_partials: Option<bool>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    /// Also record synthesized audio to WAV files
    pub save_wav: Option<bool>,
    /// Cap for a single recorded reply, in seconds
    pub max_wav_secs: Option<u32>,
}

/// LLM configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    /// Model identifier (e.g. "gemini-1.5-flash")
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub system_instruction: Option<String>,
}

/// Push-to-talk key configuration
#[derive(Debug, Default, Deserialize)]
pub struct KeysFileConfig {
    /// Key name (e.g. "space", "f9")
    pub key: Option<String>,
    pub press_debounce_ms: Option<u64>,
    pub release_debounce_ms: Option<u64>,
    pub keyup_confirm_ms: Option<u64>,
}

/// Flush timing configuration
#[derive(Debug, Default, Deserialize)]
pub struct FlushFileConfig {
    pub idle_ms: Option<u64>,
    pub hard_timeout_ms: Option<u64>,
}

/// Worker pool configuration
#[derive(Debug, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub workers: Option<usize>,
}

/// Output paths
#[derive(Debug, Default, Deserialize)]
pub struct OutputFileConfig {
    pub transcript_file: Option<String>,
    pub tts_dir: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TalkbackConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TalkbackConfigFile {
    config_file_path().map_or_else(TalkbackConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Missing or invalid files yield the default (empty) overlay.
pub fn load_from(path: &Path) -> TalkbackConfigFile {
    if !path.exists() {
        return TalkbackConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                TalkbackConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TalkbackConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/talkback/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("talkback").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let file: TalkbackConfigFile = toml::from_str(
            r#"
            [stt]
            model = "nova-2"

            [keys]
            key = "f9"
            press_debounce_ms = 80
            "#,
        )
        .unwrap();

        assert_eq!(file.stt.model.as_deref(), Some("nova-2"));
        assert_eq!(file.keys.key.as_deref(), Some("f9"));
        assert_eq!(file.keys.press_debounce_ms, Some(80));
        assert!(file.tts.voice_id.is_none());
        assert!(file.pipeline.workers.is_none());
    }

    #[test]
    fn missing_file_is_default() {
        let file = load_from(Path::new("/nonexistent/talkback/config.toml"));
        assert!(file.stt.model.is_none());
    }

    #[test]
    fn invalid_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "this is = = not toml").unwrap();

        let file = load_from(&path);
        assert!(file.llm.model.is_none());
    }
}

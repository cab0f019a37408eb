//! Talkback - push-to-talk voice assistant
//!
//! Hold a key to talk, release it to get a spoken answer:
//! - Microphone audio is resampled and streamed to a speech-to-text service
//! - Finalized transcripts are sent to a language model
//! - The reply is streamed through text-to-speech straight to the speakers
//!
//! # Architecture
//!
//! ```text
//! mic ─► Chunker ─► audio queue ─► STT send ─► STT service
//!                                                 │
//!              transcript buffer ◄─ STT receive ◄─┘
//!                     │ (key release)
//!                     ▼
//!                 job queue ─► worker ─► LLM ─► TTS ─► speakers
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod state;
pub mod voice;

pub use config::Config;
pub use error::{Error, Result};
pub use llm::{GeminiClient, Responder};
pub use pipeline::{Components, Pipeline, Speaker};
pub use state::{ControlSignal, SessionJob, Shared};

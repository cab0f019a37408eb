//! Voice I/O
//!
//! Microphone capture and chunking, speaker playback, the push-to-talk key,
//! and the two streaming speech services.

pub mod capture;
pub mod chunker;
pub mod keys;
pub mod playback;
pub mod stt;
pub mod tts;

pub use capture::{AudioCapture, DeviceInfo, list_input_devices};
pub use chunker::{AudioChunk, Chunker};
pub use keys::{GlobalKey, KeySource, parse_key};
pub use playback::{AudioOutput, AudioPlayback, BlockingPcm, PcmStream};
pub use stt::{DeepgramConnector, LinkState, SttConnector, SttSession};
pub use tts::TtsClient;

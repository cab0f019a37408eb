//! Shared pipeline state
//!
//! One [`Shared`] instance is created per pipeline and handed to every
//! component at construction, so independent pipelines never share flags.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Local};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// Broadcast flags read by the capture callback, the STT duties and the key loop
#[derive(Debug)]
pub struct Flags {
    armed: AtomicBool,
    collecting: AtomicBool,
    stopping: watch::Sender<bool>,
}

impl Default for Flags {
    fn default() -> Self {
        Self::new()
    }
}

impl Flags {
    /// Create flags with everything cleared
    #[must_use]
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            collecting: AtomicBool::new(false),
            stopping: watch::Sender::new(false),
        }
    }

    /// Whether captured audio should be forwarded to the STT service
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Release);
    }

    /// Whether final transcripts should be buffered
    #[must_use]
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    pub fn set_collecting(&self, collecting: bool) {
        self.collecting.store(collecting, Ordering::Release);
    }

    /// Clear both `armed` and `collecting`
    pub fn disarm(&self) {
        self.set_armed(false);
        self.set_collecting(false);
    }

    /// Whether global shutdown has been requested
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Request global shutdown
    pub fn stop(&self) {
        self.stopping.send_replace(true);
    }

    /// Resolve once shutdown has been requested
    pub async fn stopped(&self) {
        let mut rx = self.stopping.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

/// Finalized transcript lines of the current press-release cycle
#[derive(Debug)]
pub struct TranscriptBuffer {
    lines: Mutex<Vec<String>>,
    last_final_us: AtomicU64,
    epoch: Instant,
}

impl Default for TranscriptBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            last_final_us: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Append one final line
    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.into());
        }
    }

    /// Drop all buffered lines
    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }

    /// Snapshot and clear the buffer in one step
    #[must_use]
    pub fn take(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|mut lines| std::mem::take(&mut *lines))
            .unwrap_or_default()
    }

    /// Copy of the buffered lines
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.lock().map(|lines| lines.is_empty()).unwrap_or(true)
    }

    /// Record the arrival of a final
    ///
    /// The stored value strictly increases, so two finals in the same
    /// microsecond still register as an advance.
    pub fn mark_final(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_micros()).unwrap_or(u64::MAX);
        let _ = self
            .last_final_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
                Some(now.max(prev.saturating_add(1)))
            });
    }

    /// Arrival time of the most recent final (microseconds since the
    /// buffer was created; 0 if none)
    #[must_use]
    pub fn last_final(&self) -> u64 {
        self.last_final_us.load(Ordering::Acquire)
    }
}

/// Single-permit flush request from the finalizer to the STT send duty
#[derive(Debug, Default)]
pub struct FlushSignal {
    notify: Notify,
}

impl FlushSignal {
    /// Ask the active send duty to flush; remembered until consumed
    pub fn request(&self) {
        self.notify.notify_one();
    }

    /// Resolve when a flush has been requested
    pub async fn requested(&self) {
        self.notify.notified().await;
    }
}

/// State shared by every pipeline component
#[derive(Debug, Default)]
pub struct Shared {
    pub flags: Flags,
    pub transcript: TranscriptBuffer,
    pub flush: FlushSignal,
}

impl Shared {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// One completed utterance, ready for the LLM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionJob {
    /// Non-blank final lines joined by newlines
    pub text: String,
    /// When the utterance was finalized
    pub timestamp: DateTime<Local>,
}

impl SessionJob {
    /// Build a job from collected lines
    ///
    /// Returns `None` when nothing but whitespace was collected.
    #[must_use]
    pub fn from_lines(lines: &[String], timestamp: DateTime<Local>) -> Option<Self> {
        let text = lines
            .iter()
            .filter(|line| !line.trim().is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");

        if text.trim().is_empty() {
            return None;
        }

        Some(Self { text, timestamp })
    }
}

/// Worker to key loop notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// A job's LLM + TTS lifecycle finished, successfully or not
    TtsDone,
}

//! Shared test utilities
//!
//! Fakes for every external seam of the pipeline, so the full key → STT →
//! LLM → TTS path can run without audio hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use talkback::voice::stt::{MessageSink, MessageStream, SttConnector};
use talkback::voice::{AudioOutput, KeySource, PcmStream};
use talkback::{Error, Responder, Result, Speaker};

/// Key that is held during fixed windows, measured from creation
pub struct ScriptedKeys {
    start: Instant,
    windows: Vec<(Duration, Duration)>,
}

impl ScriptedKeys {
    /// Key held from `from_ms` until `to_ms` for each window
    pub fn new(windows: &[(u64, u64)]) -> Self {
        Self {
            start: Instant::now(),
            windows: windows
                .iter()
                .map(|&(from, to)| (Duration::from_millis(from), Duration::from_millis(to)))
                .collect(),
        }
    }
}

impl KeySource for ScriptedKeys {
    fn is_down(&self) -> bool {
        let elapsed = self.start.elapsed();
        self.windows
            .iter()
            .any(|&(from, to)| elapsed >= from && elapsed < to)
    }
}

/// Messages sent by the pipeline, with send times
pub type SentLog = Arc<Mutex<Vec<(Instant, Message)>>>;

/// Record everything sent through a [`MessageSink`]
pub fn recording_sink(sent: SentLog) -> MessageSink {
    Box::pin(futures::sink::unfold(sent, |sent, message: Message| async move {
        sent.lock().expect("sent log poisoned").push((Instant::now(), message));
        Ok::<_, Error>(sent)
    }))
}

/// Inbound stream fed from a channel; ends when the sender is dropped
pub fn channel_stream(rx: mpsc::UnboundedReceiver<Message>) -> MessageStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|message| (Ok(message), rx))
    }))
}

/// STT connector handing out scripted connections
///
/// The first `failures` attempts fail; after that each attempt consumes one
/// feed, and fails once the feeds run out.
pub struct FakeConnector {
    feeds: Mutex<VecDeque<mpsc::UnboundedReceiver<Message>>>,
    failures: AtomicUsize,
    pub attempts: Arc<Mutex<Vec<Instant>>>,
    pub sent: SentLog,
}

impl FakeConnector {
    /// Connector with `feeds` successful connections and their senders
    pub fn new(feeds: usize) -> (Arc<Self>, Vec<mpsc::UnboundedSender<Message>>) {
        Self::failing_first(0, feeds)
    }

    pub fn failing_first(
        failures: usize,
        feeds: usize,
    ) -> (Arc<Self>, Vec<mpsc::UnboundedSender<Message>>) {
        let (senders, receivers): (Vec<_>, VecDeque<_>) =
            (0..feeds).map(|_| mpsc::unbounded_channel()).unzip();

        let connector = Arc::new(Self {
            feeds: Mutex::new(receivers),
            failures: AtomicUsize::new(failures),
            attempts: Arc::new(Mutex::new(Vec::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        });
        (connector, senders)
    }

    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().expect("attempts poisoned").clone()
    }

    /// Text messages sent so far
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("sent log poisoned")
            .iter()
            .filter_map(|(_, m)| match m {
                Message::Text(t) => Some(t.as_str().to_string()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SttConnector for FakeConnector {
    async fn connect(&self) -> Result<(MessageSink, MessageStream)> {
        self.attempts
            .lock()
            .expect("attempts poisoned")
            .push(Instant::now());

        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Connection("scripted failure".to_string()));
        }

        let feed = self.feeds.lock().expect("feeds poisoned").pop_front();
        match feed {
            Some(rx) => Ok((recording_sink(Arc::clone(&self.sent)), channel_stream(rx))),
            None => Err(Error::Connection("no more connections".to_string())),
        }
    }
}

/// STT `Results` event
pub fn results_event(text: &str, is_final: bool) -> Message {
    Message::text(
        serde_json::json!({
            "type": "Results",
            "is_final": is_final,
            "channel": { "alternatives": [{ "transcript": text }] }
        })
        .to_string(),
    )
}

/// Responder that records prompts and answers with a fixed outcome
pub struct FakeResponder {
    pub calls: Mutex<Vec<String>>,
    fail: bool,
}

impl FakeResponder {
    pub fn replying() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls poisoned").clone()
    }
}

#[async_trait]
impl Responder for FakeResponder {
    async fn reply(&self, text: &str) -> Result<String> {
        self.calls
            .lock()
            .expect("calls poisoned")
            .push(text.to_string());

        if self.fail {
            return Err(Error::Connection("LLM unreachable".to_string()));
        }
        Ok(format!("You said: {text}"))
    }
}

/// Speaker that records what it was asked to say
#[derive(Default)]
pub struct FakeSpeaker {
    pub calls: Mutex<Vec<String>>,
}

impl FakeSpeaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls poisoned").clone()
    }
}

#[async_trait]
impl Speaker for FakeSpeaker {
    async fn speak(&self, text: &str) -> Result<Option<PathBuf>> {
        self.calls
            .lock()
            .expect("calls poisoned")
            .push(text.to_string());
        Ok(None)
    }
}

/// Output device that keeps every written sample
#[derive(Default)]
pub struct RecordingOutput {
    pub samples: Arc<Mutex<Vec<i16>>>,
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

impl RecordingOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn samples(&self) -> Vec<i16> {
        self.samples.lock().expect("samples poisoned").clone()
    }
}

struct RecordingStream {
    samples: Arc<Mutex<Vec<i16>>>,
    closed: Arc<AtomicUsize>,
}

impl PcmStream for RecordingStream {
    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.samples
            .lock()
            .expect("samples poisoned")
            .extend_from_slice(samples);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl AudioOutput for RecordingOutput {
    fn open(&self, _sample_rate: u32) -> Result<Box<dyn PcmStream>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingStream {
            samples: Arc::clone(&self.samples),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Poll `condition` every few milliseconds until it holds
///
/// Panics after `limit` of (paused) test time.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

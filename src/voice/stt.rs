//! Streaming speech-to-text over a persistent websocket
//!
//! One connection is kept open for the life of the process by
//! [`SttSession::run`]. Each connection has two duties that race inside one
//! `select!`: the send duty forwards armed audio with real-time pacing, and
//! the receive duty turns inbound events into finals and partials. Whichever
//! ends first ends the connection; the watchdog then reconnects with backoff.

use std::io::Write as _;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::chunker::AudioChunk;
use crate::config::SttConfig;
use crate::state::Shared;
use crate::{Error, Result};

/// Longest partial rendered on the progress line, in characters
const PARTIAL_MAX_CHARS: usize = 120;

/// How long a closing handshake may take before the socket is dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Outbound half of a service connection
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = Error> + Send>>;

/// Inbound half of a service connection
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// Opens STT connections
#[async_trait]
pub trait SttConnector: Send + Sync {
    /// Perform the handshake and return both halves of the connection
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` without a credential and `Error::Connection`
    /// if the handshake fails
    async fn connect(&self) -> Result<(MessageSink, MessageStream)>;
}

/// Connection state published by the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Handshake in progress
    Connecting,
    /// Connected and streaming
    Connected,
    /// Waiting before the next attempt
    Backoff,
}

/// Build the listen URL with every stream parameter in the query
///
/// # Errors
///
/// Returns error if the configured endpoint is not a valid URL
pub fn build_listen_url(config: &SttConfig) -> Result<Url> {
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| Error::Config(format!("invalid STT endpoint {:?}: {e}", config.endpoint)))?;

    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("language", &config.language)
        .append_pair("punctuate", bool_param(config.punctuate))
        .append_pair("smart_format", bool_param(config.smart_format))
        .append_pair("encoding", "linear16")
        .append_pair("sample_rate", &config.sample_rate.to_string())
        .append_pair("channels", &config.channels.to_string())
        .append_pair("interim_results", "true");

    Ok(url)
}

const fn bool_param(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

/// Build a websocket upgrade request carrying one credential header
///
/// # Errors
///
/// Returns error if the URL or header value is malformed
pub(crate) fn authorized_request(url: &Url, header: &'static str, value: &str) -> Result<Request> {
    let mut request = url.as_str().into_client_request()?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("invalid credential for {header}: {e}")))?;
    request
        .headers_mut()
        .insert(HeaderName::from_static(header), value);
    Ok(request)
}

/// Deepgram streaming connector
pub struct DeepgramConnector {
    config: SttConfig,
}

impl DeepgramConnector {
    #[must_use]
    pub const fn new(config: SttConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SttConnector for DeepgramConnector {
    async fn connect(&self) -> Result<(MessageSink, MessageStream)> {
        let key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| Error::Config("DEEPGRAM_API_KEY not set".to_string()))?;

        let url = build_listen_url(&self.config)?;
        let request = authorized_request(&url, "authorization", &format!("Token {}", key.expose_secret()))?;
        let ws_config =
            WebSocketConfig::default().max_message_size(Some(self.config.max_message_size));

        let (ws, _) = tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| Error::Connection(format!("STT handshake failed: {e}")))?;

        let (sink, stream) = ws.split();
        Ok((
            Box::pin(sink.sink_map_err(Error::from)),
            Box::pin(stream.map(|msg| msg.map_err(Error::from))),
        ))
    }
}

/// A transcript fragment extracted from one inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Trimmed transcript text, never empty
    pub text: String,
    /// Whether the service will not revise this fragment
    pub is_final: bool,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct ResultsEvent {
    is_final: Option<bool>,
    channel: Option<Channel>,
    channels: Option<Vec<Channel>>,
    results: Option<NestedResults>,
}

#[derive(Deserialize)]
struct NestedResults {
    is_final: Option<bool>,
    channel: Option<Channel>,
    channels: Option<Vec<Channel>>,
}

#[derive(Deserialize)]
struct Channel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Deserialize)]
struct Alternative {
    transcript: Option<String>,
}

impl Channel {
    fn first_transcript(&self) -> Option<&str> {
        self.alternatives.first().map(|a| a.transcript.as_deref().unwrap_or_default())
    }
}

/// First alternative under `channel`, else under `channels[0]`
fn lookup<'a>(channel: Option<&'a Channel>, channels: Option<&'a [Channel]>) -> Option<&'a str> {
    channel
        .and_then(Channel::first_transcript)
        .or_else(|| channels.and_then(<[Channel]>::first).and_then(Channel::first_transcript))
}

/// Parse one inbound STT event
///
/// Only `Results` events carry transcripts. The transcript is looked up in
/// this order, first hit wins:
///
/// 1. `channel.alternatives[0]` at the top level
/// 2. `channels[0].alternatives[0]` at the top level
/// 3. `results.channel.alternatives[0]`
/// 4. `results.channels[0].alternatives[0]`
///
/// Finality comes from the `is_final` next to the hit. Empty transcripts
/// yield `None`.
///
/// # Errors
///
/// Returns `Error::Protocol` if the payload is not valid JSON or a
/// `Results` event does not match the schema
pub fn parse_event(raw: &str) -> Result<Option<Fragment>> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| Error::Protocol(e.to_string()))?;
    if envelope.kind.as_deref() != Some("Results") {
        return Ok(None);
    }

    let event: ResultsEvent =
        serde_json::from_str(raw).map_err(|e| Error::Protocol(e.to_string()))?;

    let top = lookup(event.channel.as_ref(), event.channels.as_deref())
        .map(|text| (text, event.is_final));
    let nested = || {
        let results = event.results.as_ref()?;
        lookup(results.channel.as_ref(), results.channels.as_deref())
            .map(|text| (text, results.is_final))
    };

    let Some((text, is_final)) = top.or_else(nested) else {
        return Ok(None);
    };

    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    Ok(Some(Fragment {
        text: text.to_string(),
        is_final: is_final.unwrap_or(false),
    }))
}

/// Truncate a partial for the progress line
#[must_use]
pub fn truncate_partial(text: &str) -> String {
    match text.char_indices().nth(PARTIAL_MAX_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Single overwritten progress line on stderr
///
/// Clears itself when dropped, so a cancelled receive duty leaves no residue.
pub struct PartialDisplay {
    enabled: bool,
    shown: usize,
}

impl PartialDisplay {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled, shown: 0 }
    }

    /// Replace the progress line with `text`
    pub fn show(&mut self, text: &str) {
        if !self.enabled {
            return;
        }
        let line = truncate_partial(text);
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{:width$}\r{line}", "", width = self.shown);
        let _ = err.flush();
        self.shown = line.chars().count();
    }

    /// Erase the progress line
    pub fn clear(&mut self) {
        if self.shown == 0 {
            return;
        }
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{:width$}\r", "", width = self.shown);
        let _ = err.flush();
        self.shown = 0;
    }
}

impl Drop for PartialDisplay {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Catch-up hysteresis for the send duty
///
/// Pacing stops once the backlog reaches `high` and resumes once it falls
/// to `low`.
#[derive(Debug, Clone)]
pub struct Pacer {
    high: usize,
    low: usize,
    catching_up: bool,
}

impl Pacer {
    #[must_use]
    pub const fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low,
            catching_up: false,
        }
    }

    /// Feed the current backlog; returns whether pacing is suspended
    pub fn update(&mut self, backlog: usize) -> bool {
        if !self.catching_up && backlog >= self.high {
            self.catching_up = true;
            tracing::debug!(backlog, "STT send catching up");
        } else if self.catching_up && backlog <= self.low {
            self.catching_up = false;
            tracing::debug!(backlog, "STT send pacing resumed");
        }
        self.catching_up
    }
}

/// Reconnect delays; the last entry repeats until [`Backoff::reset`]
#[derive(Debug, Clone)]
pub struct Backoff {
    delays: Vec<Duration>,
    attempt: usize,
}

impl Backoff {
    #[must_use]
    pub const fn new(delays: Vec<Duration>) -> Self {
        Self { delays, attempt: 0 }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let index = self.attempt.min(self.delays.len().saturating_sub(1));
        self.attempt = self.attempt.saturating_add(1);
        self.delays.get(index).copied().unwrap_or_default()
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

fn control(kind: &str) -> Message {
    Message::text(format!(r#"{{"type":"{kind}"}}"#))
}

/// Bytes in one transmitted sub-frame
#[must_use]
pub fn subframe_bytes(config: &SttConfig) -> usize {
    let samples = u64::from(config.sample_rate) * u64::from(config.chunk_ms) / 1000;
    let bytes = samples * 2 * u64::from(config.channels.max(1));
    usize::try_from(bytes).unwrap_or(usize::MAX).max(2)
}

#[allow(clippy::cast_precision_loss)]
fn pace_for(bytes: usize, config: &SttConfig) -> Duration {
    let frames = bytes / (2 * usize::from(config.channels.max(1)));
    let secs = frames as f64 / f64::from(config.sample_rate.max(1));
    Duration::from_secs_f64(secs * config.pacing_factor)
}

/// Send duty: forward armed audio until shutdown
///
/// Chunks taken while not armed are discarded. A pending flush request is
/// sent as soon as the duty is between chunks. On shutdown a `CloseStream`
/// message is sent best-effort and the duty returns `Ok`.
///
/// # Errors
///
/// Returns error if a send fails; the connection is then considered lost
pub async fn send_audio<S>(
    sink: &mut S,
    audio: &mut mpsc::UnboundedReceiver<AudioChunk>,
    shared: &Shared,
    config: &SttConfig,
) -> Result<()>
where
    S: Sink<Message, Error = Error> + Unpin,
{
    let step = subframe_bytes(config);
    let mut pacer = Pacer::new(config.high_water, config.low_water);

    loop {
        let chunk = tokio::select! {
            biased;
            () = shared.flags.stopped() => break,
            () = shared.flush.requested() => {
                sink.send(control("Flush")).await?;
                tracing::debug!("STT flush sent");
                continue;
            }
            chunk = audio.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        if !shared.flags.is_armed() {
            tracing::trace!(bytes = chunk.len(), "discarding stale audio");
            continue;
        }

        let catching_up = pacer.update(audio.len());
        for frame in chunk.chunks(step) {
            if !shared.flags.is_armed() {
                break;
            }
            sink.send(Message::binary(frame.to_vec())).await?;
            if !catching_up {
                tokio::time::sleep(pace_for(frame.len(), config)).await;
            }
        }
    }

    if let Err(e) = sink.send(control("CloseStream")).await {
        tracing::debug!(error = %e, "STT close message not sent");
    }
    Ok(())
}

/// Receive duty: record finals, render partials
///
/// Finals always advance the last-final timestamp but are only buffered
/// while collecting. Unparseable events are skipped.
///
/// # Errors
///
/// Returns error when the stream fails or ends
pub async fn receive_transcripts<S>(
    stream: &mut S,
    shared: &Shared,
    display: &mut PartialDisplay,
) -> Result<()>
where
    S: Stream<Item = Result<Message>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(frame) => {
                tracing::debug!(frame = ?frame, "STT service closed the stream");
                break;
            }
            _ => continue,
        };

        let fragment = match parse_event(text.as_str()) {
            Ok(Some(fragment)) => fragment,
            Ok(None) => continue,
            Err(e) => {
                tracing::trace!(error = %e, "skipping STT event");
                continue;
            }
        };

        if fragment.is_final {
            display.clear();
            shared.transcript.mark_final();
            tracing::info!(text = %fragment.text, "final");
            if shared.flags.is_collecting() {
                shared.transcript.push(fragment.text);
            }
        } else if shared.flags.is_collecting() {
            tracing::trace!(text = %fragment.text, "partial");
            display.show(&fragment.text);
        }
    }

    display.clear();
    Err(Error::Connection("STT stream ended".to_string()))
}

/// Persistent STT session with reconnect watchdog
pub struct SttSession {
    connector: Arc<dyn SttConnector>,
    config: SttConfig,
    shared: Arc<Shared>,
    link: watch::Sender<LinkState>,
}

impl SttSession {
    /// Create a session publishing its link state on `link`
    #[must_use]
    pub const fn new(
        connector: Arc<dyn SttConnector>,
        config: SttConfig,
        shared: Arc<Shared>,
        link: watch::Sender<LinkState>,
    ) -> Self {
        Self {
            connector,
            config,
            shared,
            link,
        }
    }

    /// Subscribe to link state changes
    #[must_use]
    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Keep one connection alive until shutdown
    ///
    /// Connection and duty failures are logged and retried after the next
    /// backoff delay. The delay sequence restarts after every successful
    /// handshake.
    pub async fn run(self, mut audio: mpsc::UnboundedReceiver<AudioChunk>) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        let stopping = &self.shared.flags;

        while !stopping.is_stopping() {
            self.link.send_replace(LinkState::Connecting);

            let connected = tokio::select! {
                () = stopping.stopped() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok((mut sink, mut stream)) => {
                    backoff.reset();
                    self.link.send_replace(LinkState::Connected);
                    tracing::info!("STT connected");

                    let mut display = PartialDisplay::new(self.config.show_partials);
                    let outcome = tokio::select! {
                        result = send_audio(&mut sink, &mut audio, &self.shared, &self.config) => result,
                        result = receive_transcripts(&mut stream, &self.shared, &mut display) => result,
                    };
                    drop(display);

                    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
                        tracing::debug!("STT close handshake timed out");
                    }

                    match outcome {
                        Ok(()) => break,
                        Err(e) => tracing::warn!(error = %e, "STT connection lost"),
                    }
                }
                Err(e) => tracing::error!(error = %e, "STT connect failed"),
            }

            if stopping.is_stopping() {
                break;
            }

            let delay = backoff.next_delay();
            self.link.send_replace(LinkState::Backoff);
            tracing::warn!(delay_secs = delay.as_secs_f32(), "STT reconnecting");

            tokio::select! {
                () = stopping.stopped() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.link.send_replace(LinkState::Backoff);
        tracing::debug!("STT watchdog stopped");
    }
}

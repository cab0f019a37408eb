//! Finalization and flush on key release

use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::config::FlushConfig;
use crate::state::{SessionJob, Shared, TranscriptBuffer};

/// Wait for trailing finals after a flush request
///
/// Returns once no new final has arrived for `idle`, or `hard_timeout` after
/// the call started, whichever comes first. Returns the time waited.
pub async fn wait_for_finals(transcript: &TranscriptBuffer, config: &FlushConfig) -> Duration {
    let start = Instant::now();
    let mut quiet_since = start;
    let mut last_seen = transcript.last_final();

    loop {
        tokio::time::sleep(config.poll_interval).await;
        let now = Instant::now();

        let latest = transcript.last_final();
        if latest != last_seen {
            last_seen = latest;
            quiet_since = now;
        }

        if now.duration_since(quiet_since) >= config.idle
            || now.duration_since(start) >= config.hard_timeout
        {
            return now.duration_since(start);
        }
    }
}

/// Turns the collected finals of one press into a job
pub struct Finalizer {
    shared: Arc<Shared>,
    jobs: mpsc::UnboundedSender<SessionJob>,
    config: FlushConfig,
}

impl Finalizer {
    #[must_use]
    pub const fn new(
        shared: Arc<Shared>,
        jobs: mpsc::UnboundedSender<SessionJob>,
        config: FlushConfig,
    ) -> Self {
        Self {
            shared,
            jobs,
            config,
        }
    }

    /// Stop forwarding audio, flush, wait for finals and enqueue the job
    ///
    /// Returns whether a job was enqueued. Calling this with an empty buffer
    /// is a no-op apart from the flush.
    pub async fn finalize(&self) -> bool {
        self.shared.flags.set_armed(false);
        self.shared.flush.request();

        let waited = wait_for_finals(&self.shared.transcript, &self.config).await;
        let lines = self.shared.transcript.take();
        tracing::debug!(waited_ms = waited.as_millis(), lines = lines.len(), "finals settled");

        let Some(job) = SessionJob::from_lines(&lines, Local::now()) else {
            tracing::info!("nothing transcribed");
            return false;
        };

        tracing::info!(text = %job.text, "utterance complete");
        if self.jobs.send(job).is_err() {
            tracing::warn!("job queue closed, utterance dropped");
            return false;
        }
        true
    }
}

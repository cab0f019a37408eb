//! Job queue consumers
//!
//! Workers take finished utterances off the shared queue, ask the LLM for a
//! reply and speak it. With one worker replies are spoken in utterance order.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use tokio::sync::{Mutex, mpsc};

use super::transcript_log::TranscriptLog;
use crate::Result;
use crate::llm::Responder;
use crate::state::{ControlSignal, SessionJob};

/// Speaks a reply
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Synthesize and play `text`, returning the recording path if one was
    /// saved
    ///
    /// # Errors
    ///
    /// Returns `Error::EmptyText` for blank text, `Error::Config` without a
    /// credential, or any transport or device error
    async fn speak(&self, text: &str) -> Result<Option<PathBuf>>;
}

/// Receiving end of the job queue, shared by every worker
pub type JobQueue = Arc<Mutex<mpsc::UnboundedReceiver<SessionJob>>>;

/// One LLM + TTS worker
pub struct Worker {
    id: usize,
    jobs: JobQueue,
    responder: Arc<dyn Responder>,
    speaker: Arc<dyn Speaker>,
    log: TranscriptLog,
    control: mpsc::UnboundedSender<ControlSignal>,
}

impl Worker {
    #[must_use]
    pub fn new(
        id: usize,
        jobs: JobQueue,
        responder: Arc<dyn Responder>,
        speaker: Arc<dyn Speaker>,
        log: TranscriptLog,
        control: mpsc::UnboundedSender<ControlSignal>,
    ) -> Self {
        Self {
            id,
            jobs,
            responder,
            speaker,
            log,
            control,
        }
    }

    /// Process jobs until the queue is closed and drained
    pub async fn run(self) {
        tracing::debug!(worker = self.id, "worker started");

        loop {
            // The guard only serializes idle workers waiting on the queue
            let job = self.jobs.lock().await.recv().await;
            let Some(job) = job else {
                break;
            };
            self.process(job).await;
        }

        tracing::debug!(worker = self.id, "worker stopped");
    }

    /// Handle one job; always ends with `TtsDone`
    pub async fn process(&self, job: SessionJob) {
        self.log.session(&job.text, job.timestamp);

        match self.responder.reply(&job.text).await {
            Ok(reply) => {
                tracing::info!(worker = self.id, reply = %reply, "reply");
                self.log.reply(&reply, Local::now());

                match self.speaker.speak(&reply).await {
                    Ok(Some(path)) => {
                        tracing::info!(worker = self.id, path = %path.display(), "reply saved");
                    }
                    Ok(None) => {}
                    Err(e) if e.is_connection() => {
                        tracing::warn!(worker = self.id, error = %e, "TTS service unreachable");
                    }
                    Err(e) => tracing::error!(worker = self.id, error = %e, "TTS failed"),
                }
            }
            Err(e) if e.is_connection() => {
                tracing::error!(worker = self.id, error = %e, "LLM service unreachable");
            }
            Err(e) => tracing::error!(worker = self.id, error = %e, "LLM call failed"),
        }

        if self.control.send(ControlSignal::TtsDone).is_err() {
            tracing::debug!(worker = self.id, "key loop gone, ttsDone dropped");
        }
    }
}

//! Push-to-talk pipeline
//!
//! Wires the key loop, the STT session, the workers and the transcript log
//! around one [`Shared`] state, runs them until shutdown is requested, then
//! stops them in dependency order:
//!
//! 1. key loop (drops the job sender)
//! 2. STT session (sends `CloseStream`)
//! 3. workers (drain remaining jobs)
//! 4. transcript log writer

pub mod finalize;
pub mod keyloop;
pub mod transcript_log;
pub mod worker;

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

pub use finalize::{Finalizer, wait_for_finals};
pub use keyloop::{KeyAction, KeyLoop, KeyMachine, KeyState};
pub use transcript_log::TranscriptLog;
pub use worker::{JobQueue, Speaker, Worker};

use crate::config::Config;
use crate::llm::Responder;
use crate::state::Shared;
use crate::voice::chunker::AudioChunk;
use crate::voice::keys::KeySource;
use crate::voice::stt::{LinkState, SttConnector, SttSession};

/// External collaborators of the pipeline
#[derive(Clone)]
pub struct Components {
    pub keys: Arc<dyn KeySource>,
    pub stt: Arc<dyn SttConnector>,
    pub responder: Arc<dyn Responder>,
    pub speaker: Arc<dyn Speaker>,
}

/// A configured, not yet running pipeline
pub struct Pipeline {
    config: Config,
    shared: Arc<Shared>,
    components: Components,
    key_state: watch::Sender<KeyState>,
    link: watch::Sender<LinkState>,
}

impl Pipeline {
    #[must_use]
    pub fn new(config: Config, shared: Arc<Shared>, components: Components) -> Self {
        Self {
            config,
            shared,
            components,
            key_state: watch::Sender::new(KeyState::Idle),
            link: watch::Sender::new(LinkState::Connecting),
        }
    }

    /// Observe key machine transitions
    #[must_use]
    pub fn key_state(&self) -> watch::Receiver<KeyState> {
        self.key_state.subscribe()
    }

    /// Observe the STT link
    #[must_use]
    pub fn link(&self) -> watch::Receiver<LinkState> {
        self.link.subscribe()
    }

    /// Run until `shared.flags.stop()` is called, then shut down in order
    ///
    /// `audio` carries chunks from the capture callback.
    pub async fn run(self, audio: mpsc::UnboundedReceiver<AudioChunk>) {
        let Self {
            config,
            shared,
            components,
            key_state,
            link,
        } = self;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (log, log_task) = TranscriptLog::spawn(config.output.transcript_file.clone());

        let link_rx = link.subscribe();
        let session = SttSession::new(
            Arc::clone(&components.stt),
            config.stt.clone(),
            Arc::clone(&shared),
            link,
        );
        let stt_task = tokio::spawn(session.run(audio));

        let jobs: JobQueue = Arc::new(Mutex::new(jobs_rx));
        let workers: Vec<JoinHandle<()>> = (0..config.pipeline.workers)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&jobs),
                    Arc::clone(&components.responder),
                    Arc::clone(&components.speaker),
                    log.clone(),
                    control_tx.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();
        drop(control_tx);

        let key_loop = KeyLoop::new(
            Arc::clone(&components.keys),
            Arc::clone(&shared),
            link_rx,
            Finalizer::new(Arc::clone(&shared), jobs_tx, config.flush.clone()),
            control_rx,
            key_state,
            config.keys.clone(),
        );
        let key_task = tokio::spawn(key_loop.run());

        tracing::info!(
            workers = config.pipeline.workers,
            key = %config.keys.key,
            "pipeline ready, hold the key to talk"
        );

        shared.flags.stopped().await;
        tracing::info!("shutting down");

        join("key loop", key_task).await;
        join("stt session", stt_task).await;
        for worker in workers {
            join("worker", worker).await;
        }
        drop(log);
        join("transcript log", log_task).await;

        tracing::info!("pipeline stopped");
    }
}

async fn join(name: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        tracing::warn!(task = name, error = %e, "task failed");
    }
}

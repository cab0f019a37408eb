//! Push-to-talk pipeline integration tests
//!
//! Drives the full key → STT → LLM → TTS path with scripted fakes on a
//! paused clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use talkback::pipeline::{JobQueue, KeyState, TranscriptLog, Worker};
use talkback::voice::LinkState;
use talkback::voice::chunker::AudioChunk;
use talkback::{Components, Config, ControlSignal, Pipeline, SessionJob, Shared};

mod common;
use common::{FakeConnector, FakeResponder, FakeSpeaker, ScriptedKeys, results_event, wait_until};

struct Harness {
    shared: Arc<Shared>,
    connector: Arc<FakeConnector>,
    feeds: Vec<mpsc::UnboundedSender<Message>>,
    responder: Arc<FakeResponder>,
    speaker: Arc<FakeSpeaker>,
    key_state: watch::Receiver<KeyState>,
    link: watch::Receiver<LinkState>,
    _audio: mpsc::UnboundedSender<AudioChunk>,
    task: JoinHandle<()>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn start(
        windows: &[(u64, u64)],
        connector: (Arc<FakeConnector>, Vec<mpsc::UnboundedSender<Message>>),
        responder: Arc<FakeResponder>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.output.transcript_file = dir.path().join("transcripts.txt");
        config.stt.show_partials = false;

        let shared = Arc::new(Shared::new());
        let (connector, feeds) = connector;
        let speaker = FakeSpeaker::new();

        let components = Components {
            keys: Arc::new(ScriptedKeys::new(windows)),
            stt: connector.clone(),
            responder: responder.clone(),
            speaker: speaker.clone(),
        };

        let pipeline = Pipeline::new(config, Arc::clone(&shared), components);
        let key_state = pipeline.key_state();
        let link = pipeline.link();

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pipeline.run(audio_rx));

        Self {
            shared,
            connector,
            feeds,
            responder,
            speaker,
            key_state,
            link,
            _audio: audio_tx,
            task,
            dir,
        }
    }

    async fn wait_for_state(&mut self, state: KeyState) {
        tokio::time::timeout(
            Duration::from_secs(5),
            self.key_state.wait_for(|s| *s == state),
        )
        .await
        .expect("key state not reached in time")
        .expect("key loop gone");
    }

    async fn stop(self) -> tempfile::TempDir {
        self.shared.flags.stop();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("pipeline did not stop")
            .expect("pipeline panicked");
        self.dir
    }
}

#[tokio::test(start_paused = true)]
async fn test_held_key_produces_one_reply() {
    let mut h = Harness::start(&[(100, 300)], FakeConnector::new(1), FakeResponder::replying());

    let shared = Arc::clone(&h.shared);
    wait_until(Duration::from_secs(1), || shared.flags.is_collecting()).await;
    assert!(shared.flags.is_armed());

    h.feeds[0].send(results_event("testing", false)).unwrap();
    h.feeds[0].send(results_event("testing one two", true)).unwrap();

    let speaker = Arc::clone(&h.speaker);
    wait_until(Duration::from_secs(2), || speaker.calls().len() == 1).await;
    h.wait_for_state(KeyState::Idle).await;

    assert_eq!(h.responder.calls(), vec!["testing one two".to_string()]);
    assert_eq!(h.speaker.calls(), vec!["You said: testing one two".to_string()]);
    assert!(!h.shared.flags.is_armed());
    assert!(!h.shared.flags.is_collecting());

    let connector = Arc::clone(&h.connector);
    let dir = h.stop().await;

    let sent = connector.sent_text();
    assert!(sent.iter().any(|m| m.contains("Flush")));
    assert_eq!(sent.last().map(String::as_str), Some(r#"{"type":"CloseStream"}"#));

    let log = std::fs::read_to_string(dir.path().join("transcripts.txt")).unwrap();
    assert!(log.contains("--- Session @ "));
    assert!(log.contains("testing one two\n--- Reply @ "));
    assert!(log.contains("You said: testing one two"));
}

#[tokio::test(start_paused = true)]
async fn test_multiple_finals_join_with_newlines() {
    let h = Harness::start(&[(0, 400)], FakeConnector::new(1), FakeResponder::replying());

    let shared = Arc::clone(&h.shared);
    wait_until(Duration::from_secs(1), || shared.flags.is_collecting()).await;

    h.feeds[0].send(results_event("hello", true)).unwrap();
    h.feeds[0].send(results_event("world", true)).unwrap();

    let responder = Arc::clone(&h.responder);
    wait_until(Duration::from_secs(2), || !responder.calls().is_empty()).await;
    assert_eq!(h.responder.calls(), vec!["hello\nworld".to_string()]);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_short_press_is_ignored() {
    let mut h = Harness::start(&[(100, 130)], FakeConnector::new(1), FakeResponder::replying());

    let mut states = h.key_state.clone();
    let observer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while states.changed().await.is_ok() {
            seen.push(*states.borrow_and_update());
        }
        seen
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.wait_for_state(KeyState::Idle).await;

    assert!(h.responder.calls().is_empty());
    assert!(!h.shared.flags.is_armed());
    h.stop().await;

    let seen = observer.await.unwrap();
    assert!(seen.contains(&KeyState::DebouncingPress));
    assert!(!seen.contains(&KeyState::Recording));
}

#[tokio::test(start_paused = true)]
async fn test_empty_utterance_creates_no_job() {
    let mut h = Harness::start(&[(0, 200)], FakeConnector::new(1), FakeResponder::replying());

    h.wait_for_state(KeyState::Recording).await;
    h.wait_for_state(KeyState::WaitingKeyUp).await;
    h.wait_for_state(KeyState::Idle).await;

    assert!(h.responder.calls().is_empty());
    assert!(h.speaker.calls().is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_llm_failure_skips_tts_and_rearms() {
    let mut h = Harness::start(&[(0, 200)], FakeConnector::new(1), FakeResponder::failing());

    let shared = Arc::clone(&h.shared);
    wait_until(Duration::from_secs(1), || shared.flags.is_collecting()).await;
    h.feeds[0].send(results_event("what time is it", true)).unwrap();

    let responder = Arc::clone(&h.responder);
    wait_until(Duration::from_secs(2), || !responder.calls().is_empty()).await;
    h.wait_for_state(KeyState::Idle).await;

    assert!(h.speaker.calls().is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_press_without_link_is_aborted() {
    let mut h = Harness::start(&[(100, 400)], FakeConnector::new(0), FakeResponder::replying());

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_ne!(*h.link.borrow(), LinkState::Connected);
    assert!(!h.shared.flags.is_armed());
    assert!(!h.shared.flags.is_collecting());
    h.wait_for_state(KeyState::Idle).await;
    assert!(h.responder.calls().is_empty());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_press_after_reply() {
    let h = Harness::start(
        &[(0, 200), (1000, 1200)],
        FakeConnector::new(1),
        FakeResponder::replying(),
    );

    let shared = Arc::clone(&h.shared);
    wait_until(Duration::from_secs(1), || shared.flags.is_collecting()).await;
    h.feeds[0].send(results_event("first", true)).unwrap();

    let responder = Arc::clone(&h.responder);
    wait_until(Duration::from_secs(2), || responder.calls().len() == 1).await;

    wait_until(Duration::from_secs(2), || shared.flags.is_collecting()).await;
    h.feeds[0].send(results_event("second", true)).unwrap();
    wait_until(Duration::from_secs(2), || responder.calls().len() == 2).await;

    assert_eq!(
        h.responder.calls(),
        vec!["first".to_string(), "second".to_string()]
    );
    assert_eq!(h.speaker.calls().len(), 2);
    h.stop().await;
}

fn worker(
    responder: Arc<FakeResponder>,
    speaker: Arc<FakeSpeaker>,
    log: TranscriptLog,
) -> (Worker, mpsc::UnboundedReceiver<ControlSignal>) {
    let (_jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let jobs: JobQueue = Arc::new(tokio::sync::Mutex::new(jobs_rx));
    (
        Worker::new(0, jobs, responder, speaker, log, control_tx),
        control_rx,
    )
}

fn job(text: &str) -> SessionJob {
    SessionJob::from_lines(&[text.to_string()], Local::now()).unwrap()
}

#[tokio::test]
async fn test_worker_llm_error_signals_done_once() {
    let dir = tempfile::tempdir().unwrap();
    let (log, log_task) = TranscriptLog::spawn(dir.path().join("t.txt"));
    let responder = FakeResponder::failing();
    let speaker = FakeSpeaker::new();
    let (worker, mut control) = worker(responder.clone(), speaker.clone(), log.clone());

    worker.process(job("hello")).await;
    drop(worker);
    drop(log);

    assert_eq!(control.recv().await, Some(ControlSignal::TtsDone));
    assert_eq!(control.recv().await, None);
    assert_eq!(responder.calls().len(), 1);
    assert!(speaker.calls().is_empty());

    log_task.await.unwrap();
    let written = std::fs::read_to_string(dir.path().join("t.txt")).unwrap();
    assert!(written.contains("hello"));
    assert!(!written.contains("--- Reply @ "));
}

#[tokio::test]
async fn test_workers_drain_queue_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let (log, log_task) = TranscriptLog::spawn(dir.path().join("t.txt"));
    let responder = FakeResponder::replying();
    let speaker = FakeSpeaker::new();

    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let jobs: JobQueue = Arc::new(tokio::sync::Mutex::new(jobs_rx));

    for text in ["one", "two", "three"] {
        jobs_tx.send(job(text)).unwrap();
    }
    drop(jobs_tx);

    let handles: Vec<_> = (0..2)
        .map(|id| {
            let worker = Worker::new(
                id,
                Arc::clone(&jobs),
                responder.clone(),
                speaker.clone(),
                log.clone(),
                control_tx.clone(),
            );
            tokio::spawn(worker.run())
        })
        .collect();
    drop(control_tx);
    drop(log);

    for handle in handles {
        handle.await.unwrap();
    }
    log_task.await.unwrap();

    let mut done = 0;
    while control_rx.recv().await.is_some() {
        done += 1;
    }
    assert_eq!(done, 3);

    let mut prompts = responder.calls();
    prompts.sort();
    assert_eq!(prompts, vec!["one", "three", "two"]);
    assert_eq!(speaker.calls().len(), 3);
}

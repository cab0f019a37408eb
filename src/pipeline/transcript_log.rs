//! Append-only transcript log
//!
//! Entries go through a channel to one writer task, so they land in the
//! order they were logged and a slow or failing disk never delays a reply.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Header block written before the LLM call
#[must_use]
pub fn session_entry(text: &str, at: DateTime<Local>) -> String {
    format!("\n--- Session @ {} ---\n{text}\n", at.format(TIMESTAMP_FORMAT))
}

/// Block written once the reply is known
#[must_use]
pub fn reply_entry(reply: &str, at: DateTime<Local>) -> String {
    format!("--- Reply @ {} ---\n{reply}\n", at.format(TIMESTAMP_FORMAT))
}

/// Handle to the transcript writer
#[derive(Debug, Clone)]
pub struct TranscriptLog {
    tx: mpsc::UnboundedSender<String>,
}

impl TranscriptLog {
    /// Start the writer task for `path`
    ///
    /// The task exits once every handle has been dropped and the queue is
    /// drained.
    #[must_use]
    pub fn spawn(path: PathBuf) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(write_entries(path, rx));
        (Self { tx }, task)
    }

    /// Log the user's utterance
    pub fn session(&self, text: &str, at: DateTime<Local>) {
        self.append(session_entry(text, at));
    }

    /// Log the assistant's reply
    pub fn reply(&self, reply: &str, at: DateTime<Local>) {
        self.append(reply_entry(reply, at));
    }

    fn append(&self, entry: String) {
        if self.tx.send(entry).is_err() {
            tracing::debug!("transcript log closed, entry dropped");
        }
    }
}

async fn write_entries(path: PathBuf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(entry) = rx.recv().await {
        if let Err(e) = append_to(&path, &entry).await {
            tracing::warn!(path = %path.display(), error = %e, "transcript log write failed");
        }
    }
    tracing::debug!("transcript log writer stopped");
}

async fn append_to(path: &Path, entry: &str) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(entry.as_bytes()).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn noon() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn entry_formats() {
        assert_eq!(
            session_entry("hello", noon()),
            "\n--- Session @ 2024-05-01 12:00:00 ---\nhello\n"
        );
        assert_eq!(
            reply_entry("hi", noon()),
            "--- Reply @ 2024-05-01 12:00:00 ---\nhi\n"
        );
    }

    #[tokio::test]
    async fn entries_are_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcripts.txt");
        std::fs::write(&path, "existing\n").unwrap();

        let (log, task) = TranscriptLog::spawn(path.clone());
        log.session("one", noon());
        log.reply("two", noon());
        drop(log);
        task.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "existing\n\n--- Session @ 2024-05-01 12:00:00 ---\none\n\
             --- Reply @ 2024-05-01 12:00:00 ---\ntwo\n"
        );
    }

    #[tokio::test]
    async fn write_failure_does_not_stop_writer() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for append
        let (log, task) = TranscriptLog::spawn(dir.path().to_path_buf());
        log.session("lost", noon());
        drop(log);
        task.await.unwrap();
    }
}

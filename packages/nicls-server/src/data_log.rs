//! Append-only JSON-lines record of every control message.
//!
//! [`DataLog`] is a cheap handle; entries go over a channel to one writer
//! task that owns the file. Writing never blocks the protocol loop.

use crate::protocol::TaskMessage;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Received,
    Sent,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    time: f64,
    #[serde(rename = "type")]
    kind: &'static str,
    data: Map<String, Value>,
    direction: Direction,
}

#[derive(Clone, Default)]
pub struct DataLog {
    tx: Option<mpsc::UnboundedSender<LogEntry>>,
}

impl DataLog {
    /// Open `path` for appending and start the writer task.
    ///
    /// The task ends once every handle is dropped and the queue is drained.
    pub async fn open<P: AsRef<Path>>(path: P) -> std::io::Result<(Self, JoinHandle<()>)> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Activity log opened");

        let (tx, mut rx) = mpsc::unbounded_channel::<LogEntry>();
        let writer = tokio::spawn(async move {
            let mut written = 0u64;
            while let Some(first) = rx.recv().await {
                let mut batch = Vec::new();
                let mut next = Some(first);
                while let Some(entry) = next {
                    match serde_json::to_vec(&entry) {
                        Ok(mut line) => {
                            line.push(b'\n');
                            batch.extend_from_slice(&line);
                            written += 1;
                        }
                        Err(e) => error!("Failed to encode log entry: {}", e),
                    }
                    next = rx.try_recv().ok();
                }

                if let Err(e) = file.write_all(&batch).await {
                    error!(path = %path.display(), "Activity log write failed: {}", e);
                    continue;
                }
                if let Err(e) = file.flush().await {
                    error!(path = %path.display(), "Activity log flush failed: {}", e);
                }
            }
            info!(path = %path.display(), written, "Activity log closed");
        });

        Ok((Self { tx: Some(tx) }, writer))
    }

    /// A log that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn received(&self, message: &TaskMessage) {
        self.record(message, Direction::Received);
    }

    pub fn sent(&self, message: &TaskMessage) {
        self.record(message, Direction::Sent);
    }

    fn record(&self, message: &TaskMessage, direction: Direction) {
        let Some(tx) = &self.tx else {
            return;
        };
        let entry = LogEntry {
            time: message.time,
            kind: message.kind.as_str(),
            data: message.data.clone(),
            direction,
        };
        // Writer gone means the server is shutting down
        let _ = tx.send(entry);
    }
}

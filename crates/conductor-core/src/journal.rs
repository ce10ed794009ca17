use crate::event::{Event, EventSink};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Append-only JSONL journal of every published event.
///
/// Events are handed to a background task over an unbounded channel and
/// written one line each, in publish order.
pub struct JsonlEventLog {
    tx: mpsc::UnboundedSender<Entry>,
    path: PathBuf,
}

enum Entry {
    Event(Box<Event>),
    /// Answered once everything queued before it has been written.
    Sync(oneshot::Sender<()>),
}

impl JsonlEventLog {
    /// Create the journal at `path`. Spawns the writer task, so this must be
    /// called from inside a tokio runtime.
    pub fn new(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Entry>();
        let file_path = path.clone();

        tokio::spawn(async move {
            if let Some(parent) = file_path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %file_path.display(), error = %e, "event journal unavailable");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                let event = match entry {
                    Entry::Event(event) => event,
                    Entry::Sync(done) => {
                        let _ = done.send(());
                        continue;
                    }
                };
                let Ok(line) = serde_json::to_string(&event) else {
                    continue;
                };
                let line = format!("{line}\n");
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "failed to append event");
                    continue;
                }
                let _ = file.flush().await;
            }
        });

        Self { tx, path }
    }

    /// Wait until every event published so far has been written. Returns
    /// immediately when the journal could not be opened.
    pub async fn sync(&self) {
        let (done, written) = oneshot::channel();
        if self.tx.send(Entry::Sync(done)).is_ok() {
            let _ = written.await;
        }
    }

    /// Where the journal is written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventLog {
    fn publish(&self, event: Event) {
        info!(
            run_id = %event.run_id,
            topic = %event.topic,
            agent = event.agent().unwrap_or("-"),
            "event"
        );
        let _ = self.tx.send(Entry::Event(Box::new(event)));
    }
}

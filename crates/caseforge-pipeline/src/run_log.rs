use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use caseforge_core::event::{EventBus, WorkflowEvent};
use caseforge_core::types::SessionId;

/// JSONL audit log for one workflow run.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{log_dir}/{session_id}/{timestamp}.jsonl`. Lines are flushed as they are
/// written, so a crash mid-run leaves every earlier line intact.
pub struct RunLogger {
    log_dir: PathBuf,
}

/// A single log line.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a WorkflowEvent,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Subscribe now and write in a background task.
    ///
    /// Subscribing before the spawn means the `run_started` event of a run
    /// started right after this call is never missed. The task ends on the
    /// session's `run_finished` event, on cancellation, or when the bus closes.
    pub fn spawn(
        self,
        events: &EventBus,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let rx = events.subscribe();
        tokio::spawn(self.write_events(rx, session_id, cancel))
    }

    async fn write_events(
        self,
        mut rx: tokio::sync::broadcast::Receiver<WorkflowEvent>,
        session_id: SessionId,
        cancel: CancellationToken,
    ) {
        let session_dir = self.log_dir.join(&session_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = session_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            // The bus may be shared by concurrent sessions
                            if event.session_id() != &session_id {
                                continue;
                            }
                            if let Some(line) = to_line(&event) {
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                            if matches!(event, WorkflowEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }
}

fn to_line(event: &WorkflowEvent) -> Option<String> {
    let entry = LogEntry {
        timestamp: Utc::now().to_rfc3339(),
        event,
    };
    serde_json::to_string(&entry).ok().map(|json| json + "\n")
}

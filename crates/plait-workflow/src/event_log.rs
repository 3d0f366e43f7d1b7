use std::path::PathBuf;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use plait_core::event::{EventKind, WorkflowEvent};
use plait_core::types::RunId;

/// JSONL event logger.
///
/// Consumes a run's event stream and appends one JSON object per event to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash never loses an event that was already logged.
pub struct EventLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single line of the log file.
#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

impl EventLogger {
    /// `level` controls verbosity: 1=run events, 2=plus step events,
    /// 3=plus stream deltas.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Write entries until a terminal event or the end of the stream.
    pub async fn run(self, run_id: RunId, mut events: BoxStream<'static, WorkflowEvent>) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&run_id);
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

        info!(path = %log_path.display(), "EventLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        while let Some(event) = events.next().await {
            if let Some(entry) = self.event_to_entry(&event) {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }

            if event.kind.is_terminal() {
                break;
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "EventLogger finished");
    }

    fn event_level(kind: &EventKind) -> u8 {
        match kind {
            EventKind::RunStarted { .. }
            | EventKind::RunFinished { .. }
            | EventKind::RunCancelled {}
            | EventKind::RunError { .. } => 1,
            EventKind::StreamDelta { .. } => 3,
            _ => 2,
        }
    }

    /// Convert an event to a log entry (None if filtered by level).
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        if Self::event_level(&event.kind) > self.level {
            return None;
        }

        let detail = match serde_json::to_value(&event.kind) {
            Ok(Value::Object(mut fields)) => {
                fields.remove("type");
                fields.remove("stepId");
                (!fields.is_empty()).then_some(Value::Object(fields))
            }
            _ => None,
        };

        Some(LogEntry {
            timestamp: event.ts.to_rfc3339(),
            run_id: event.run_id.to_string(),
            event_type: event.name().to_string(),
            step_id: event.kind.step_id().map(str::to_string),
            detail,
        })
    }
}

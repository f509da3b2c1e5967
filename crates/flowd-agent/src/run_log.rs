use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use flowd_core::event::{EventBus, FlowEvent};

/// File for events that do not belong to a run.
const DAEMON_LOG: &str = "daemon.jsonl";

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and appends one JSON object per line, one file
/// per run (`{log_dir}/runs/{run_id}.jsonl`) plus `{log_dir}/daemon.jsonl` for
/// scheduler events. A run's file is closed when the run completes or fails.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1=run summary, 2=nodes and input, 3=model attempts.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger until cancellation or until the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(self.log_dir.join("runs")).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        info!(path = %self.log_dir.display(), "RunLogger started");

        let mut rx = event_bus.subscribe();
        let mut files: HashMap<String, BufWriter<tokio::fs::File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };
                            let file_key = entry.run_id.clone().unwrap_or_else(|| DAEMON_LOG.to_string());

                            if !files.contains_key(&file_key) {
                                match open_log(&self.log_path(entry.run_id.as_deref())).await {
                                    Ok(writer) => {
                                        files.insert(file_key.clone(), writer);
                                    }
                                    Err(e) => {
                                        error!(error = %e, "Failed to open log file");
                                        continue;
                                    }
                                }
                            }

                            if let (Some(writer), Ok(json)) = (files.get_mut(&file_key), serde_json::to_string(&entry)) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                }
                                // Flush after each entry for crash resilience
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event, FlowEvent::RunCompleted { .. } | FlowEvent::RunError { .. }) {
                                files.remove(&file_key);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        for writer in files.values_mut() {
            writer.flush().await.ok();
        }
        debug!("RunLogger finished");
    }

    fn log_path(&self, run_id: Option<&str>) -> PathBuf {
        match run_id {
            Some(run_id) => self.log_dir.join("runs").join(format!("{}.jsonl", run_id)),
            None => self.log_dir.join(DAEMON_LOG),
        }
    }

    /// Convert a FlowEvent to a log entry (returns None if filtered by level).
    fn event_to_entry(&self, event: &FlowEvent) -> Option<LogEntry> {
        let (min_level, event_type, detail) = match event {
            // L1: run summary
            FlowEvent::RunCreated { flow_id, .. } => {
                (1, "run_created", serde_json::json!({ "flow_id": flow_id }))
            }
            FlowEvent::RunCompleted { flow_id, .. } => {
                (1, "run_completed", serde_json::json!({ "flow_id": flow_id }))
            }
            FlowEvent::RunError { flow_id, error, .. } => (
                1,
                "run_error",
                serde_json::json!({ "flow_id": flow_id, "error": error }),
            ),
            FlowEvent::SchedulingRaceDropped {
                flow_id,
                trigger_index,
            } => (
                1,
                "scheduling_race_dropped",
                serde_json::json!({ "flow_id": flow_id, "trigger_index": trigger_index }),
            ),
            FlowEvent::FlowStatusChanged { flow_id, status } => (
                1,
                "flow_status_changed",
                serde_json::json!({ "flow_id": flow_id, "status": status }),
            ),

            // L2: nodes, input and trigger activity
            FlowEvent::TriggerFired {
                flow_id,
                trigger_index,
                trigger,
            } => (
                2,
                "trigger_fired",
                serde_json::json!({
                    "flow_id": flow_id,
                    "trigger_index": trigger_index,
                    "trigger": trigger,
                }),
            ),
            FlowEvent::RunStatusChanged { status, .. } => {
                (2, "run_status_changed", serde_json::json!({ "status": status }))
            }
            FlowEvent::NodeStarted { node_id, name, .. } => (
                2,
                "node_started",
                serde_json::json!({ "node_id": node_id, "name": name }),
            ),
            FlowEvent::NodeStatusChanged { node_id, status, .. } => (
                2,
                "node_status_changed",
                serde_json::json!({ "node_id": node_id, "status": status }),
            ),
            FlowEvent::InputRequested {
                node_id,
                input_wait_id,
                ..
            } => (
                2,
                "input_requested",
                serde_json::json!({ "node_id": node_id, "input_wait_id": input_wait_id }),
            ),
            FlowEvent::InputSubmitted {
                node_id,
                input_wait_id,
                ..
            } => (
                2,
                "input_submitted",
                serde_json::json!({ "node_id": node_id, "input_wait_id": input_wait_id }),
            ),
            FlowEvent::LiveStatus { node_id, text, .. } => (
                2,
                "live_status",
                serde_json::json!({ "node_id": node_id, "text": truncate_str(text, 200) }),
            ),

            // L3: model attempts
            FlowEvent::LlmAttempt {
                correlation,
                model,
                attempt,
                error,
                duration_ms,
            } => (
                3,
                "llm_attempt",
                serde_json::json!({
                    "correlation": correlation.to_string(),
                    "model": model,
                    "attempt": attempt,
                    "error": error,
                    "duration_ms": duration_ms,
                }),
            ),
        };

        if self.level < min_level {
            return None;
        }

        let run_id = match event {
            FlowEvent::LlmAttempt { correlation, .. } if correlation.key == "runId" => {
                Some(correlation.value.clone())
            }
            _ => event.run_id().map(|r| r.to_string()),
        };

        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            run_id,
            detail: Some(detail),
        })
    }
}

async fn open_log(path: &Path) -> std::io::Result<BufWriter<tokio::fs::File>> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

/// Truncate a string for logging.
fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

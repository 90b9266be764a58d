use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// One line of `audit.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// When the entry was queued.
    pub timestamp: DateTime<Utc>,
    /// The API key involved, when one was identified.
    pub key_id: Option<String>,
    /// Snake-case name such as `key_created` or `auth_rejected`.
    pub action: String,
    /// Free-form context for the action.
    pub details: serde_json::Value,
    /// Whether the action went through.
    pub outcome: AuditOutcome,
}

/// How an audited action ended.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action completed.
    Success,
    /// Refused for lack of a valid key or scope.
    Denied,
    /// Failed for reasons other than access control.
    Error,
}

/// Append-only audit log of key lifecycle and access decisions.
///
/// Entries are written as JSON lines to `audit.jsonl` in the log directory by
/// a background task, so logging never blocks a request.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns a background task that writes entries to disk.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEntry>();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(error = %e, dir = %log_dir.display(), "Cannot create audit directory");
                return;
            }
            let log_file = log_dir.join("audit.jsonl");
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, file = %log_file.display(), "Cannot open audit log");
                    return;
                }
            };

            while let Some(entry) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&entry) {
                    let line = format!("{line}\n");
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        warn!(error = %e, "Audit write failed");
                        continue;
                    }
                    let _ = file.flush().await;
                }
            }
        });

        Self { tx }
    }

    /// Queues an entry for the writer and mirrors it to tracing.
    pub fn log(&self, entry: AuditEntry) {
        info!(
            key_id = entry.key_id.as_deref().unwrap_or("-"),
            action = %entry.action,
            outcome = ?entry.outcome,
            "audit"
        );
        let _ = self.tx.send(entry);
    }

    /// Builds and logs an entry stamped with the current time.
    pub fn log_action(
        &self,
        key_id: Option<&str>,
        action: impl Into<String>,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        self.log(AuditEntry {
            timestamp: Utc::now(),
            key_id: key_id.map(str::to_string),
            action: action.into(),
            details,
            outcome,
        });
    }
}

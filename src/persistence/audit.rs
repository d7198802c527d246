//! Append-only audit log of every message seen on the state topic.
//!
//! Every call to [`AuditRecorder::record`] spawns its own write, so the panel
//! controller never waits on disk. Each record is serialized to one JSON line
//! and appended with a single write to a file opened in append mode; records
//! written concurrently therefore never interleave. Cancelling a ticket is best
//! effort: a write already handed to the blocking pool may still land, and
//! readers must tolerate duplicates.

use crate::mqtt::message_manager::InboundMessage;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub topic: String,
    pub payload: String,
    pub id: String,
    pub timestamp: DateTime<Local>,
}

impl From<&InboundMessage> for AuditRecord {
    fn from(message: &InboundMessage) -> Self {
        Self {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            id: message.id.clone(),
            timestamp: message.received_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit log I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not encode audit record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Audit write cancelled")]
    Cancelled,

    #[error("Audit task failed: {0}")]
    Task(String),
}

/// A failed write, shared by the ticket and the error channel.
pub type SharedAuditError = Arc<AuditError>;

/// Handle on one in-flight audit write.
#[derive(Debug)]
pub struct AuditTicket {
    token: CancellationToken,
    handle: JoinHandle<Result<(), SharedAuditError>>,
}

impl AuditTicket {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<(), SharedAuditError> {
        self.handle
            .await
            .map_err(|e| Arc::new(AuditError::Task(e.to_string())))?
    }
}

#[derive(Debug, Clone)]
pub struct AuditRecorder {
    path: Arc<PathBuf>,
    root: CancellationToken,
    error_tx: mpsc::UnboundedSender<SharedAuditError>,
}

impl AuditRecorder {
    /// Failures of individual writes are sent to `error_tx`; they are never
    /// returned to the caller of [`record`](Self::record).
    pub fn new(path: impl Into<PathBuf>, error_tx: mpsc::UnboundedSender<SharedAuditError>) -> Self {
        Self {
            path: Arc::new(path.into()),
            root: CancellationToken::new(),
            error_tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, message: &InboundMessage) -> AuditTicket {
        let record = AuditRecord::from(message);
        let token = self.root.child_token();
        let path = Arc::clone(&self.path);
        let error_tx = self.error_tx.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = task_token.cancelled() => Err(AuditError::Cancelled),
                res = append_record(&path, &record) => res,
            }
            .map_err(Arc::new);
            match &result {
                Ok(()) => debug!("Audited {} on {}", record.payload, record.topic),
                Err(e) if matches!(**e, AuditError::Cancelled) => {
                    debug!("Audit of {} cancelled", record.id)
                }
                Err(e) => {
                    warn!("Audit write failed: {}", e);
                    let _ = error_tx.send(Arc::clone(e));
                }
            }
            result
        });

        AuditTicket { token, handle }
    }

    /// Requests cancellation of every outstanding write.
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }
}

async fn append_record(path: &Path, record: &AuditRecord) -> Result<(), AuditError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let io_err = |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)?;
    file.write_all(line.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    Ok(())
}

/// Reads the audit log back, skipping lines that do not parse.
pub async fn read_all(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(AuditError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<AuditRecord>(line) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping malformed audit line: {}", e);
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(dir: &Path) -> (AuditRecorder, mpsc::UnboundedReceiver<SharedAuditError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AuditRecorder::new(dir.join("logs").join("audit.jsonl"), tx), rx)
    }

    #[tokio::test]
    async fn records_are_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, _errors) = recorder(dir.path());

        audit
            .record(&InboundMessage::new("home/alarm", "armed_away", "1"))
            .wait()
            .await
            .unwrap();
        audit
            .record(&InboundMessage::new("home/alarm", "pending", "2"))
            .wait()
            .await
            .unwrap();

        let records = read_all(audit.path()).await.unwrap();
        let payloads: Vec<&str> = records.iter().map(|r| r.payload.as_str()).collect();
        assert_eq!(payloads, vec!["armed_away", "pending"]);
        assert_eq!(records[1].id, "2");
    }

    #[tokio::test]
    async fn overlapping_writes_stay_line_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, _errors) = recorder(dir.path());

        let tickets: Vec<AuditTicket> = (0..32)
            .map(|i| audit.record(&InboundMessage::new("home/alarm", "triggered", i.to_string())))
            .collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        let records = read_all(audit.path()).await.unwrap();
        assert_eq!(records.len(), 32);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (audit, _errors) = recorder(dir.path());

        audit.shutdown();
        let ticket = audit.record(&InboundMessage::new("home/alarm", "disarmed", "9"));
        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(*err, AuditError::Cancelled));
        assert!(audit.is_shut_down());
    }

    #[tokio::test]
    async fn failures_go_to_error_channel() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let audit = AuditRecorder::new(blocker.join("audit.jsonl"), tx);
        let err = audit
            .record(&InboundMessage::new("home/alarm", "pending", "3"))
            .wait()
            .await
            .unwrap_err();

        let reported = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&err, &reported));
        match &*reported {
            AuditError::Io { path, .. } => assert_eq!(path, &blocker.join("audit.jsonl")),
            other => panic!("expected an I/O error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let good = serde_json::to_string(&AuditRecord::from(&InboundMessage::new("t", "pending", "1"))).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n{good}\n")).unwrap();

        assert_eq!(read_all(&path).await.unwrap().len(), 2);
    }
}

//! Audit trail for device actions and profile verification.
//!
//! Every accepted, rejected, and completed action produces an event, as does
//! every verification pass. Events are fanned out to pluggable sinks.
//!
//! Unlock PINs are never part of an event. Sink failures are logged and
//! swallowed: the audit trail must not be able to fail a device action.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

use crate::types::{ActionKind, ActionResult, Channel, CorrelationId, DeviceId};

/// Errors from audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("sink error: {0}")]
    SinkError(String),
    #[error("io error: {0}")]
    IoError(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<std::io::Error> for AuditError {
    fn from(e: std::io::Error) -> Self {
        AuditError::IoError(e.to_string())
    }
}

/// Audit events emitted by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEvent {
    ActionRequested {
        device_id: DeviceId,
        kind: ActionKind,
        channel: Channel,
        correlation_id: CorrelationId,
        timestamp: DateTime<Utc>,
    },
    ActionRejected {
        device_id: DeviceId,
        kind: ActionKind,
        /// Stable error code, see [`ActionError::code`](crate::errors::ActionError::code)
        code: String,
        timestamp: DateTime<Utc>,
    },
    ActionCompleted {
        device_id: DeviceId,
        kind: ActionKind,
        correlation_id: CorrelationId,
        result: ActionResult,
        timestamp: DateTime<Utc>,
    },
    ProfilesVerified {
        device_id: DeviceId,
        verified: usize,
        retrying: usize,
        failed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AuditEvent::ActionRequested { .. } => "ACTION_REQUESTED",
            AuditEvent::ActionRejected { .. } => "ACTION_REJECTED",
            AuditEvent::ActionCompleted { .. } => "ACTION_COMPLETED",
            AuditEvent::ProfilesVerified { .. } => "PROFILES_VERIFIED",
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        match self {
            AuditEvent::ActionRequested { device_id, .. }
            | AuditEvent::ActionRejected { device_id, .. }
            | AuditEvent::ActionCompleted { device_id, .. }
            | AuditEvent::ProfilesVerified { device_id, .. } => device_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::ActionRequested { timestamp, .. }
            | AuditEvent::ActionRejected { timestamp, .. }
            | AuditEvent::ActionCompleted { timestamp, .. }
            | AuditEvent::ProfilesVerified { timestamp, .. } => *timestamp,
        }
    }

    /// Format the event as a human-readable log line.
    pub fn to_log_line(&self) -> String {
        let ts = self.timestamp().to_rfc3339();
        let head = format!("[{}] {} device={}", ts, self.event_type(), self.device_id());
        match self {
            AuditEvent::ActionRequested {
                kind,
                channel,
                correlation_id,
                ..
            } => format!(
                "{head} kind={kind} channel={} correlation={correlation_id}",
                channel.as_str()
            ),
            AuditEvent::ActionRejected { kind, code, .. } => {
                format!("{head} kind={kind} code={code}")
            }
            AuditEvent::ActionCompleted {
                kind,
                correlation_id,
                result,
                ..
            } => format!(
                "{head} kind={kind} correlation={correlation_id} result={}",
                result.as_str()
            ),
            AuditEvent::ProfilesVerified {
                verified,
                retrying,
                failed,
                ..
            } => format!("{head} verified={verified} retrying={retrying} failed={failed}"),
        }
    }

    /// Single-line JSON encoding used by [`FileAuditSink`].
    pub fn to_json_line(&self) -> Result<String, AuditError> {
        serde_json::to_string(self).map_err(|e| AuditError::SerializationError(e.to_string()))
    }
}

/// Trait for audit event sinks.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// In-memory audit sink for testing and buffering.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: RwLock<Vec<AuditEvent>>,
    max_events: usize,
}

impl MemoryAuditSink {
    /// Create a new memory sink with the given capacity.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: RwLock::new(Vec::with_capacity(max_events)),
            max_events,
        }
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }

    pub async fn count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        if self.max_events == 0 {
            return Ok(());
        }
        let mut events = self.events.write().await;
        if events.len() >= self.max_events {
            events.remove(0); // drop oldest
        }
        events.push(event);
        Ok(())
    }
}

/// Append-only JSON-lines audit file.
#[derive(Debug)]
pub struct FileAuditSink {
    path: PathBuf,
}

impl FileAuditSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn append_line(&self, line: &str) -> Result<(), AuditError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        Ok(())
    }
}

#[async_trait]
impl AuditSink for FileAuditSink {
    async fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let line = event.to_json_line()?;
        self.append_line(&line).await
    }
}

/// Dispatches events to every registered sink.
#[derive(Clone, Default)]
pub struct AuditLogger {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLogger {
    /// Create a logger with no sinks; events are dropped.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn AuditSink>) {
        self.sinks.push(sink);
    }

    /// Emit an event to all sinks. A failing sink is logged and skipped.
    pub async fn emit(&self, event: AuditEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.emit(event.clone()).await {
                warn!(
                    event_type = event.event_type(),
                    device_id = %event.device_id(),
                    error = %e,
                    "Audit sink failed"
                );
            }
        }
    }

    pub async fn action_requested(
        &self,
        device_id: DeviceId,
        kind: ActionKind,
        channel: Channel,
        correlation_id: CorrelationId,
    ) {
        self.emit(AuditEvent::ActionRequested {
            device_id,
            kind,
            channel,
            correlation_id,
            timestamp: Utc::now(),
        })
        .await
    }

    pub async fn action_rejected(&self, device_id: DeviceId, kind: ActionKind, code: &str) {
        self.emit(AuditEvent::ActionRejected {
            device_id,
            kind,
            code: code.to_string(),
            timestamp: Utc::now(),
        })
        .await
    }

    pub async fn action_completed(
        &self,
        device_id: DeviceId,
        kind: ActionKind,
        correlation_id: CorrelationId,
        result: ActionResult,
    ) {
        self.emit(AuditEvent::ActionCompleted {
            device_id,
            kind,
            correlation_id,
            result,
            timestamp: Utc::now(),
        })
        .await
    }

    pub async fn profiles_verified(
        &self,
        device_id: DeviceId,
        verified: usize,
        retrying: usize,
        failed: usize,
    ) {
        self.emit(AuditEvent::ProfilesVerified {
            device_id,
            verified,
            retrying,
            failed,
            timestamp: Utc::now(),
        })
        .await
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

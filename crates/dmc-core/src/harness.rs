//! Test helpers shared by unit tests, integration tests, and the demo.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::errors::TransportError;
use crate::store::{InMemoryStore, Store};
use crate::transport::{CommandTransport, ProtocolCommand, ScriptRequest};
use crate::types::{CorrelationId, Device, DeviceId, Enrollment, EnrollmentStatus, Platform};

/// Solution name used by [`make_device`] and the default config.
pub const TEST_SOLUTION: &str = "dmc";

/// An enrolled, connected device with script support on the given platform.
pub fn make_device(platform: Platform) -> Device {
    let id = DeviceId::new_random();
    Device {
        id,
        hostname: format!("{}-{}", platform.as_str(), &id.to_string()[..8]),
        platform,
        enrollment: Enrollment {
            status: EnrollmentStatus::Enrolled,
            solution_name: TEST_SOLUTION.to_string(),
            connected_to_this_control_plane: true,
        },
        agent_supports_scripts: true,
        detail_updated_at: Utc::now(),
    }
}

/// Create a device with [`make_device`] and save it.
///
/// Panics if the store rejects the write.
pub async fn seed_device(store: &dyn Store, platform: Platform) -> Device {
    let device = make_device(platform);
    store
        .save_device(device.clone())
        .await
        .expect("seed device");
    device
}

/// A call captured by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Protocol {
        device_id: DeviceId,
        command: ProtocolCommand,
    },
    Script {
        device_id: DeviceId,
        request: ScriptRequest,
    },
}

/// Transport that records every enqueue and accepts it.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<RecordedCall>>,
    reassign_ids: bool,
    next_id: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue under `queued-<n>` instead of echoing the caller's id.
    pub fn with_reassigned_ids(mut self) -> Self {
        self.reassign_ids = true;
        self
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    fn assign(&self, requested: &CorrelationId) -> CorrelationId {
        if self.reassign_ids {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            CorrelationId::from(format!("queued-{n}"))
        } else {
            requested.clone()
        }
    }
}

#[async_trait]
impl CommandTransport for RecordingTransport {
    async fn enqueue_protocol_command(
        &self,
        device_id: &DeviceId,
        command: &ProtocolCommand,
    ) -> Result<CorrelationId, TransportError> {
        self.calls.lock().await.push(RecordedCall::Protocol {
            device_id: *device_id,
            command: command.clone(),
        });
        Ok(self.assign(&command.command_uuid))
    }

    async fn enqueue_script_execution(
        &self,
        device_id: &DeviceId,
        request: &ScriptRequest,
    ) -> Result<CorrelationId, TransportError> {
        self.calls.lock().await.push(RecordedCall::Script {
            device_id: *device_id,
            request: request.clone(),
        });
        Ok(self.assign(&request.execution_id))
    }
}

/// Transport whose every enqueue fails.
#[derive(Debug, Default)]
pub struct FailingTransport {
    attempts: AtomicUsize,
}

impl FailingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandTransport for FailingTransport {
    async fn enqueue_protocol_command(
        &self,
        _device_id: &DeviceId,
        _command: &ProtocolCommand,
    ) -> Result<CorrelationId, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Unavailable("push service unreachable".into()))
    }

    async fn enqueue_script_execution(
        &self,
        _device_id: &DeviceId,
        _request: &ScriptRequest,
    ) -> Result<CorrelationId, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Unavailable("script queue unreachable".into()))
    }
}

/// Transport that takes an [`InMemoryStore`] offline right after delegating
/// an enqueue, whatever its outcome.
///
/// Models the store going away between dispatch and the bookkeeping that
/// follows it.
pub struct StoreOutageTransport {
    inner: Arc<dyn CommandTransport>,
    store: Arc<InMemoryStore>,
}

impl StoreOutageTransport {
    pub fn new(inner: Arc<dyn CommandTransport>, store: Arc<InMemoryStore>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl CommandTransport for StoreOutageTransport {
    async fn enqueue_protocol_command(
        &self,
        device_id: &DeviceId,
        command: &ProtocolCommand,
    ) -> Result<CorrelationId, TransportError> {
        let sent = self.inner.enqueue_protocol_command(device_id, command).await;
        self.store.set_offline(true);
        sent
    }

    async fn enqueue_script_execution(
        &self,
        device_id: &DeviceId,
        request: &ScriptRequest,
    ) -> Result<CorrelationId, TransportError> {
        let sent = self.inner.enqueue_script_execution(device_id, request).await;
        self.store.set_offline(true);
        sent
    }
}

//! Boundary to the external process execution service.

use crate::ServiceError;
use async_trait::async_trait;
use tabterm_types::{CreateProcessOptions, ProcessEvent, ProcessInfo};
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Push-based event stream for one process. Dropping it unsubscribes.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl OutputStream {
    pub fn new(rx: mpsc::UnboundedReceiver<ProcessEvent>) -> Self {
        Self { rx }
    }

    /// Create a connected sender/stream pair.
    pub fn channel() -> (mpsc::UnboundedSender<ProcessEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(rx))
    }

    /// Next event, or `None` once the service dropped the subscription.
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}

/// Spawns and drives OS processes on behalf of tabs.
///
/// Every call may be pending for an unbounded time. Output for a given process
/// is delivered in production order; nothing is guaranteed across processes.
/// Subscribing again to the same process replaces the previous subscriber.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn create_process(
        &self,
        tab_id: Uuid,
        opts: &CreateProcessOptions,
    ) -> ServiceResult<ProcessInfo>;

    async fn get_process(&self, process_id: Uuid) -> ServiceResult<ProcessInfo>;

    async fn kill_process(&self, process_id: Uuid) -> ServiceResult<()>;

    async fn resize(&self, process_id: Uuid, cols: u16, rows: u16) -> ServiceResult<()>;

    async fn send_input(&self, process_id: Uuid, data: &[u8], tab_id: Uuid) -> ServiceResult<()>;

    async fn subscribe_output(&self, process_id: Uuid) -> ServiceResult<OutputStream>;
}

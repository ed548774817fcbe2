use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use exportdesk_core::realtime::RealtimeMessage;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("realtime transport failed: {0}")]
    Transport(String),
    #[error("realtime endpoint rejected message with status {status}")]
    Rejected { status: u16 },
    #[error("realtime payload could not be encoded: {0}")]
    Encode(String),
}

/// Live delivery of published events to dashboards and other listeners.
///
/// Pushes run off the publish path; an error here is logged by the bus and never reaches
/// the publisher.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn push(&self, message: &RealtimeMessage) -> Result<(), RealtimeError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopRealtimeChannel;

#[async_trait]
impl RealtimeChannel for NoopRealtimeChannel {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn push(&self, _message: &RealtimeMessage) -> Result<(), RealtimeError> {
        Ok(())
    }
}

/// In-process fan-out for listeners living in the same binary.
#[derive(Clone, Debug)]
pub struct BroadcastRealtimeChannel {
    sender: broadcast::Sender<RealtimeMessage>,
}

impl BroadcastRealtimeChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeMessage> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl RealtimeChannel for BroadcastRealtimeChannel {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    async fn push(&self, message: &RealtimeMessage) -> Result<(), RealtimeError> {
        // No live receivers is not a delivery failure.
        if self.sender.receiver_count() > 0 {
            self.sender
                .send(message.clone())
                .map_err(|error| RealtimeError::Transport(error.to_string()))?;
        }
        Ok(())
    }
}

//! Correlation store for telemetry, acknowledgements and pending commands
//!
//! All three maps live behind one `RwLock` so a snapshot is always a
//! consistent view: a reader never sees a half-applied update. Slots are
//! overwritten in arrival order; message timestamps play no part.

use crate::model::{
    Acknowledgement, CommandStatus, Millis, PendingCommand, StateSnapshot, TelemetryReading,
};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct StoreState {
    telemetry: HashMap<String, TelemetryReading>,
    acks: HashMap<String, Acknowledgement>,
    pending: HashMap<String, PendingCommand>,
}

/// Process-wide in-memory state, created once at startup and shared by `Arc`
#[derive(Debug, Default)]
pub struct CorrelationStore {
    state: RwLock<StoreState>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the latest reading for the device
    pub async fn record_telemetry(&self, reading: TelemetryReading) {
        let mut state = self.state.write().await;
        state.telemetry.insert(reading.device_id.clone(), reading);
    }

    /// Replaces the latest acknowledgement for the device
    pub async fn record_ack(&self, ack: Acknowledgement) {
        let mut state = self.state.write().await;
        state.acks.insert(ack.device_id.clone(), ack);
    }

    pub async fn create_pending(&self, command: PendingCommand) {
        let mut state = self.state.write().await;
        if state.pending.contains_key(&command.request_id) {
            // uuid v4 collisions are not expected; keep the first registration
            warn!("Duplicate request id {}, keeping existing entry", command.request_id);
            return;
        }
        state.pending.insert(command.request_id.clone(), command);
    }

    /// Moves a pending command to `outcome`.
    ///
    /// Unknown request ids are tolerated: the ack may belong to a command
    /// issued before this process started. Returns whether a command matched.
    pub async fn resolve_pending(&self, request_id: &str, outcome: CommandStatus) -> bool {
        let mut state = self.state.write().await;
        match state.pending.get_mut(request_id) {
            Some(command) => {
                command.status = outcome;
                true
            }
            None => {
                debug!("Ack for unknown request {}", request_id);
                false
            }
        }
    }

    /// Marks a command whose publish failed; no ack will follow
    pub async fn mark_error(&self, request_id: &str) -> bool {
        self.resolve_pending(request_id, CommandStatus::Error).await
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let state = self.state.read().await;
        StateSnapshot {
            telemetry: state.telemetry.clone(),
            acks: state.acks.clone(),
            pending: state.pending.clone(),
        }
    }

    /// Drops settled (`ok`/`error`) commands created before `cutoff`.
    /// Pending commands are kept regardless of age.
    pub async fn evict_settled(&self, cutoff: Millis) -> usize {
        let mut state = self.state.write().await;
        let before = state.pending.len();
        state
            .pending
            .retain(|_, cmd| cmd.status == CommandStatus::Pending || cmd.created_at >= cutoff);
        before - state.pending.len()
    }
}

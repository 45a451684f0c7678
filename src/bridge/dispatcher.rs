//! Command dispatcher: topic addressing, request ids, pending registration
//!
//! ```text
//! dispatch(device, type, value) ──► PendingCommand{pending} ──► CommandPublisher
//!                                          │                        │
//!                                          └──── mark_error ◄───────┘ (publish failed)
//! ```

use super::store::CorrelationStore;
use crate::error::BridgeError;
use crate::model::{now_ms, CommandPayload, CommandStatus, CommandType, PendingCommand};
use crate::mqtt::codec::encode_command;
use crate::mqtt::topic::CommandTopicTemplate;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Outbound side of the broker connection.
///
/// `publish` resolves once the broker has completed the publish handshake
/// for the configured QoS, not when the device acknowledges the command.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Fails fast when the transport is unconfigured or down, before any
    /// command is registered
    fn check_available(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError>;
}

/// Fresh 128-bit random request id
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct CommandDispatcher {
    template: CommandTopicTemplate,
    store: Arc<CorrelationStore>,
    publisher: Arc<dyn CommandPublisher>,
}

impl CommandDispatcher {
    pub fn new(
        template: CommandTopicTemplate,
        store: Arc<CorrelationStore>,
        publisher: Arc<dyn CommandPublisher>,
    ) -> Self {
        Self {
            template,
            store,
            publisher,
        }
    }

    /// Publishes a command and returns its request id.
    ///
    /// The command is registered as pending before it is sent. If the publish
    /// fails the entry is marked `error` before the error is returned. An
    /// unconfigured or disconnected transport fails before registration.
    pub async fn dispatch(
        &self,
        device_id: &str,
        command_type: CommandType,
        value: &str,
        speed: Option<u32>,
    ) -> Result<String, BridgeError> {
        self.dispatch_as(new_request_id(), device_id, command_type, value, speed)
            .await
    }

    /// Same as [`dispatch`](Self::dispatch) with a request id chosen by the
    /// caller, for callers that correlate acks before the publish returns
    pub async fn dispatch_as(
        &self,
        request_id: String,
        device_id: &str,
        command_type: CommandType,
        value: &str,
        speed: Option<u32>,
    ) -> Result<String, BridgeError> {
        self.publisher.check_available()?;

        let topic = self.template.render(device_id, command_type.channel());
        let created_at = now_ms();

        let payload = CommandPayload {
            request_id: request_id.clone(),
            device_id: device_id.to_string(),
            command_type,
            value: value.to_string(),
            speed,
            timestamp: created_at,
        };

        self.store
            .create_pending(PendingCommand {
                request_id: request_id.clone(),
                device_id: device_id.to_string(),
                command_type,
                value: value.to_string(),
                created_at,
                status: CommandStatus::Pending,
            })
            .await;

        debug!("Publishing command {:?} to {}", payload, topic);

        match self.publisher.publish(&topic, encode_command(&payload)).await {
            Ok(()) => {
                info!(
                    "Sent {} {} to {} (request {})",
                    command_type, value, device_id, request_id
                );
                Ok(request_id)
            }
            Err(e) => {
                self.store.mark_error(&request_id).await;
                let e = e.for_command(&request_id, &topic);
                error!("Failed to publish command to {}: {}", topic, e);
                Err(e)
            }
        }
    }
}

//! # Telemetry / command bridge
//!
//! Wires the broker connection to the in-memory core:
//!
//! ```text
//! ConnectionManager ──[InboundMessage]──► InboundProcessor
//!        ▲                                   │  decode (codec)
//!        │ publish                           ├─► CorrelationStore
//!        │                                   ├─► EventBus ──► subscribers / LiveStream
//! CommandDispatcher ◄── FanAutomation ◄──────┘
//! ```
//!
//! Inbound messages are processed one at a time in arrival order on a
//! dedicated task. Command dispatch (from callers or from the automation
//! rule) runs on other tasks, so waiting for a broker acknowledgement never
//! holds up inbound traffic.

pub mod automation;
pub mod dispatcher;
pub mod events;
pub mod store;
pub mod stream;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::model::{now_ms, CommandType, StateSnapshot};
use crate::mqtt::codec::{decode_ack, decode_telemetry};
use crate::mqtt::connection::{ConnectionManager, ConnectionState, InboundMessage};
use crate::mqtt::topic::CommandTopicTemplate;
use automation::FanAutomation;
use dispatcher::CommandDispatcher;
use events::{EventBus, Subscription};
use std::sync::Arc;
use std::time::Duration;
use store::CorrelationStore;
use stream::LiveStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Serial consumer of inbound broker messages
pub struct InboundProcessor {
    store: Arc<CorrelationStore>,
    bus: Arc<EventBus>,
    automation: Arc<FanAutomation>,
}

impl InboundProcessor {
    pub fn new(
        store: Arc<CorrelationStore>,
        bus: Arc<EventBus>,
        automation: Arc<FanAutomation>,
    ) -> Self {
        Self {
            store,
            bus,
            automation,
        }
    }

    pub async fn handle(&self, message: InboundMessage) {
        match message {
            InboundMessage::Telemetry(payload) => {
                self.handle_telemetry(&payload).await;
            }
            InboundMessage::Ack { topic, payload } => {
                debug!("Ack on {}", topic);
                self.handle_ack(&payload).await;
            }
        }
    }

    /// Store, notify, then run the fan rule. Returns the automation's
    /// dispatch task if one was started
    pub async fn handle_telemetry(&self, payload: &[u8]) -> Option<JoinHandle<()>> {
        let reading = decode_telemetry(payload).ok()?;
        debug!("Telemetry parsed: {:?}", reading);

        self.store.record_telemetry(reading.clone()).await;
        self.bus.publish_telemetry(&reading);
        self.automation.evaluate(&reading)
    }

    pub async fn handle_ack(&self, payload: &[u8]) {
        let Ok(ack) = decode_ack(payload) else {
            return;
        };
        debug!("Ack parsed: {:?}", ack);

        self.store.record_ack(ack.clone()).await;
        self.store.resolve_pending(&ack.request_id, ack.outcome()).await;
        self.automation.on_ack(&ack);
        self.bus.publish_ack(&ack);
    }

    pub async fn run(self, mut rx: mpsc::Receiver<InboundMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }
        debug!("Inbound processor stopped");
    }
}

/// Running bridge: the entry point for the request-handling layer
pub struct Bridge {
    store: Arc<CorrelationStore>,
    bus: Arc<EventBus>,
    dispatcher: Arc<CommandDispatcher>,
    connection: Arc<ConnectionManager>,
    stream_keep_alive: Duration,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Builds every component and spawns the background tasks. Must be
    /// called inside a tokio runtime.
    pub fn start(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let cancel = CancellationToken::new();
        let store = Arc::new(CorrelationStore::new());
        let bus = Arc::new(EventBus::new());
        let mut tasks = Vec::new();

        let (inbound_tx, inbound_rx) = mpsc::channel(config.broker.inbound_buffer.max(1));
        let (connection, connection_task) =
            ConnectionManager::spawn(&config.broker, &config.topics, inbound_tx, cancel.clone())?;
        let connection = Arc::new(connection);
        tasks.extend(connection_task);

        let dispatcher = Arc::new(CommandDispatcher::new(
            CommandTopicTemplate::new(config.topics.command_template.clone()),
            store.clone(),
            connection.clone(),
        ));
        let automation = Arc::new(FanAutomation::new(config.automation, dispatcher.clone()));

        let processor = InboundProcessor::new(store.clone(), bus.clone(), automation);
        tasks.push(tokio::spawn(processor.run(inbound_rx, cancel.clone())));

        if let Some(retention) = config.pending_retention_secs {
            tasks.push(tokio::spawn(sweep_settled(
                store.clone(),
                Duration::from_secs(retention.max(1)),
                cancel.clone(),
            )));
        }

        info!(
            "Bridge started (telemetry: {}, acks: {}, commands: {})",
            config.topics.telemetry, config.topics.ack_pattern, config.topics.command_template
        );

        Ok(Self {
            store,
            bus,
            dispatcher,
            connection,
            stream_keep_alive: Duration::from_secs(config.stream.keep_alive_secs.max(1)),
            cancel,
            tasks,
        })
    }

    /// Publishes a device command; returns its request id once the broker
    /// has accepted it
    pub async fn dispatch(
        &self,
        device_id: &str,
        command_type: CommandType,
        value: &str,
        speed: Option<u32>,
    ) -> Result<String, BridgeError> {
        self.dispatcher
            .dispatch(device_id, command_type, value, speed)
            .await
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.store.snapshot().await
    }

    pub fn subscribe_telemetry<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&crate::model::TelemetryReading) -> color_eyre::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe_telemetry(handler)
    }

    pub fn subscribe_ack<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&crate::model::Acknowledgement) -> color_eyre::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe_ack(handler)
    }

    /// Live event stream for one external consumer
    pub fn open_stream(&self) -> LiveStream {
        LiveStream::open(&self.bus, self.stream_keep_alive)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Cancels the background tasks and waits for them to finish
    pub async fn shutdown(self) {
        info!("Shutting down bridge");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("Bridge task panicked: {}", e);
            }
        }
    }
}

async fn sweep_settled(store: Arc<CorrelationStore>, retention: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(retention);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let cutoff = now_ms() - retention.as_millis() as i64;
                let evicted = store.evict_settled(cutoff).await;
                if evicted > 0 {
                    info!("Evicted {} settled commands", evicted);
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::automation::FanThresholds;
    use super::testing::RecordingPublisher;
    use super::*;
    use crate::model::{CommandStatus, FanState};
    use std::sync::Mutex;

    struct Harness {
        processor: InboundProcessor,
        store: Arc<CorrelationStore>,
        bus: Arc<EventBus>,
        dispatcher: Arc<CommandDispatcher>,
        automation: Arc<FanAutomation>,
        publisher: Arc<RecordingPublisher>,
    }

    fn harness() -> Harness {
        let store = Arc::new(CorrelationStore::new());
        let bus = Arc::new(EventBus::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let dispatcher = Arc::new(CommandDispatcher::new(
            CommandTopicTemplate::new("aluna/commands/<deviceId>/<channel>"),
            store.clone(),
            publisher.clone(),
        ));
        let automation = Arc::new(FanAutomation::new(
            FanThresholds::default(),
            dispatcher.clone(),
        ));
        Harness {
            processor: InboundProcessor::new(store.clone(), bus.clone(), automation.clone()),
            store,
            bus,
            dispatcher,
            automation,
            publisher,
        }
    }

    #[tokio::test]
    async fn telemetry_updates_store_notifies_and_triggers_the_fan_rule() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.bus.subscribe_telemetry(move |r| {
            sink.lock().unwrap().push(r.device_id.clone());
            Ok(())
        });

        let task = h
            .processor
            .handle_telemetry(br#"{"deviceId":"nano-esp32-01","temperature":29,"humidity":40}"#)
            .await;
        task.unwrap().await.unwrap();

        let snapshot = h.store.snapshot().await;
        assert_eq!(snapshot.telemetry["nano-esp32-01"].temperature, 29.0);
        assert_eq!(*seen.lock().unwrap(), vec!["nano-esp32-01".to_string()]);
        assert_eq!(h.publisher.sent().len(), 1);
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(h.automation.last_issued("nano-esp32-01"), Some(FanState::On));
    }

    #[tokio::test]
    async fn malformed_telemetry_changes_nothing() {
        let h = harness();
        let notified = Arc::new(Mutex::new(0));
        let counter = notified.clone();
        let _sub = h.bus.subscribe_telemetry(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        for payload in [
            &br#"{"temperature":29,"humidity":40}"#[..],
            br#"{"deviceId":"d1","temperature":"warm","humidity":40}"#,
            b"garbage",
        ] {
            assert!(h.processor.handle_telemetry(payload).await.is_none());
        }

        assert_eq!(h.store.snapshot().await, StateSnapshot::default());
        assert_eq!(*notified.lock().unwrap(), 0);
        assert!(h.publisher.sent().is_empty());
    }

    #[tokio::test]
    async fn ack_resolves_the_dispatched_command() {
        let h = harness();
        let request_id = h
            .dispatcher
            .dispatch("d1", CommandType::LightSet, "ON", None)
            .await
            .unwrap();
        assert_eq!(
            h.store.snapshot().await.pending[&request_id].status,
            CommandStatus::Pending
        );

        let acks = Arc::new(Mutex::new(Vec::new()));
        let sink = acks.clone();
        let _sub = h.bus.subscribe_ack(move |ack| {
            sink.lock().unwrap().push(ack.request_id.clone());
            Ok(())
        });

        let payload = format!(
            r#"{{"requestId":"{}","deviceId":"d1","status":"ok"}}"#,
            request_id
        );
        h.processor
            .handle(InboundMessage::Ack {
                topic: "aluna/devices/d1/ack".to_string(),
                payload: payload.into_bytes(),
            })
            .await;

        let snapshot = h.store.snapshot().await;
        assert_eq!(snapshot.pending[&request_id].status, CommandStatus::Ok);
        assert_eq!(snapshot.acks["d1"].request_id, request_id);
        assert_eq!(*acks.lock().unwrap(), vec![request_id]);
    }

    #[tokio::test]
    async fn ack_for_unknown_request_leaves_pending_untouched() {
        let h = harness();
        let request_id = h
            .dispatcher
            .dispatch("d1", CommandType::FanSet, "OFF", None)
            .await
            .unwrap();

        h.processor
            .handle_ack(br#"{"requestId":"not-ours","deviceId":"d1","status":"error"}"#)
            .await;

        let snapshot = h.store.snapshot().await;
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[&request_id].status, CommandStatus::Pending);
        assert_eq!(snapshot.acks["d1"].request_id, "not-ours");
    }

    #[tokio::test]
    async fn processor_consumes_messages_in_arrival_order() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let store = h.store.clone();
        let task = tokio::spawn(h.processor.run(rx, cancel.clone()));

        for temperature in [20, 21, 22] {
            let payload = format!(
                r#"{{"deviceId":"d1","temperature":{},"humidity":50}}"#,
                temperature
            );
            tx.send(InboundMessage::Telemetry(payload.into_bytes()))
                .await
                .unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(store.snapshot().await.telemetry["d1"].temperature, 22.0);
    }

    #[tokio::test]
    async fn bridge_without_broker_rejects_commands() {
        let bridge = Bridge::start(&BridgeConfig::default()).unwrap();
        assert_eq!(bridge.connection_state(), ConnectionState::Disconnected);

        let err = bridge
            .dispatch("d1", CommandType::LightSet, "ON", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnconfiguredTransport));
        assert!(bridge.snapshot().await.pending.is_empty());

        bridge.shutdown().await;
    }
}

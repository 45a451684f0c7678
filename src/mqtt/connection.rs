//! Broker connection lifecycle with a statum state machine
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!                     ▲  │            │
//!                     │  └─(retry)    │ connection lost
//!                     └───────────────┘ (after reconnect interval)
//! ```
//!
//! The link owns the rumqttc event loop. On every ConnAck it subscribes to
//! the telemetry topic and the ack filter, routes inbound publishes to the
//! inbound processor in arrival order, and feeds publish completions to the
//! [`PublishTracker`]. It retries forever; only cancellation stops it.
//!
//! Without a broker url no link is created and the manager stays
//! `Disconnected`, refusing to publish.

use super::publish_tracker::PublishTracker;
use super::topic::TopicPattern;
use crate::bridge::dispatcher::CommandPublisher;
use crate::config::{BrokerAddress, BrokerConfig, TopicConfig};
use crate::error::BridgeError;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use serde::Serialize;
use statum::{machine, state};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLIENT_CHANNEL_CAPACITY: usize = 100;

/// Observable connection status
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// A broker publish already classified by topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Telemetry(Vec<u8>),
    Ack { topic: String, payload: Vec<u8> },
}

/// Topic routing for inbound publishes
#[derive(Debug, Clone)]
pub struct InboundRoutes {
    telemetry_topic: String,
    ack_pattern: TopicPattern,
}

impl InboundRoutes {
    pub fn new(topics: &TopicConfig) -> Self {
        Self {
            telemetry_topic: topics.telemetry.clone(),
            ack_pattern: TopicPattern::compile(&topics.ack_pattern),
        }
    }

    /// Filters subscribed on every connect
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            self.telemetry_topic.clone(),
            self.ack_pattern.filter().to_string(),
        ]
    }

    /// Telemetry topic is checked first; anything unmatched is ignored
    pub fn route(&self, topic: &str, payload: &[u8]) -> Option<InboundMessage> {
        if topic == self.telemetry_topic {
            Some(InboundMessage::Telemetry(payload.to_vec()))
        } else if self.ack_pattern.matches(topic) {
            Some(InboundMessage::Ack {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            })
        } else {
            None
        }
    }
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn mqtt_options(broker: &BrokerConfig, address: &BrokerAddress, client_id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(client_id, address.host.clone(), address.port);
    options
        .set_keep_alive(Duration::from_secs(broker.keep_alive_secs.max(5)))
        .set_clean_session(broker.clean_session);

    if let Some(username) = &broker.username {
        options.set_credentials(username.clone(), broker.password.clone().unwrap_or_default());
    }
    if address.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

fn publish_failed(topic: &str, reason: String) -> BridgeError {
    BridgeError::PublishFailed {
        request_id: String::new(),
        topic: topic.to_string(),
        reason,
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owner of the broker event loop, one state per lifecycle phase
#[machine]
pub struct BrokerLink<S: LinkState> {
    client: AsyncClient,
    eventloop: EventLoop,
    routes: InboundRoutes,
    qos: QoS,
    reconnect_interval: Duration,
    inbound_tx: mpsc::Sender<InboundMessage>,
    tracker: Arc<PublishTracker>,
    status_tx: watch::Sender<ConnectionState>,
}

impl<S: LinkState> BrokerLink<S> {
    fn report(&self, state: ConnectionState) {
        debug!("Connection state -> {:?}", state);
        self.status_tx.send_replace(state);
    }
}

impl BrokerLink<Disconnected> {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        client: AsyncClient,
        eventloop: EventLoop,
        routes: InboundRoutes,
        qos: QoS,
        reconnect_interval: Duration,
        inbound_tx: mpsc::Sender<InboundMessage>,
        tracker: Arc<PublishTracker>,
        status_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self::new(
            client,
            eventloop,
            routes,
            qos,
            reconnect_interval,
            inbound_tx,
            tracker,
            status_tx,
        )
    }

    pub fn connect(self) -> BrokerLink<Connecting> {
        self.report(ConnectionState::Connecting);
        self.transition()
    }
}

impl BrokerLink<Connecting> {
    /// Polls until the broker accepts the connection, retrying every
    /// reconnect interval. Returns `None` once cancelled.
    pub async fn establish(mut self, cancel: &CancellationToken) -> Option<BrokerLink<Connected>> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    self.report(ConnectionState::Disconnected);
                    return None;
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    info!("Connected to MQTT broker ({:?})", connack.code);
                    return Some(self.subscribe_all());
                }
                Ok(other) => debug!("Event while connecting: {:?}", other),
                Err(e) => {
                    warn!("MQTT client error: {}", e);
                    self.tracker.fail_all(&format!("broker unreachable: {}", e));
                    if !self.wait_retry(cancel).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Sleeps for the reconnect interval; false if cancelled meanwhile.
    ///
    /// The returned future does not borrow the link: the event loop inside
    /// it is not `Sync`, and the supervisor must stay `Send`.
    pub fn wait_retry(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = bool> + Send + 'static {
        let status_tx = self.status_tx.clone();
        let interval = self.reconnect_interval;
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    status_tx.send_replace(ConnectionState::Disconnected);
                    false
                }
                _ = tokio::time::sleep(interval) => {
                    info!("Reconnecting to MQTT broker...");
                    true
                }
            }
        }
    }

    fn subscribe_all(self) -> BrokerLink<Connected> {
        let topics = self.routes.subscriptions();
        debug!("Subscribing to {:?}", topics);
        for topic in topics {
            // try_subscribe: this task is the one draining the request queue
            if let Err(e) = self.client.try_subscribe(topic.clone(), self.qos) {
                error!("Subscribe request for {} failed: {}", topic, e);
            }
        }
        self.report(ConnectionState::Connected);
        self.transition()
    }
}

impl BrokerLink<Connected> {
    /// Processes broker traffic until the connection drops (returns the
    /// link in `Connecting`) or the bridge is cancelled (returns `None`)
    pub async fn run(mut self, cancel: &CancellationToken) -> Option<BrokerLink<Connecting>> {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Disconnecting from MQTT broker");
                    if let Err(e) = self.client.try_disconnect() {
                        debug!("Disconnect request failed: {}", e);
                    }
                    self.tracker.fail_all("bridge shutting down");
                    self.report(ConnectionState::Disconnected);
                    return None;
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(message) = self.route_inbound(&publish.topic, &publish.payload)
                    else {
                        continue;
                    };
                    let inbound_tx = self.inbound_tx.clone();
                    if inbound_tx.send(message).await.is_err() {
                        warn!(
                            "Inbound processor has stopped, dropping message on {}",
                            publish.topic
                        );
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    self.log_granted(&suback.return_codes);
                }
                Ok(Event::Incoming(Packet::PubRec(pubrec))) => {
                    self.tracker.on_received(pubrec.pkid);
                }
                Ok(Event::Incoming(Packet::PubAck(puback))) => {
                    self.tracker.on_acknowledged(puback.pkid);
                }
                Ok(Event::Incoming(Packet::PubComp(pubcomp))) => {
                    self.tracker.on_acknowledged(pubcomp.pkid);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.tracker.on_sent(pkid);
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection lost: {}", e);
                    self.tracker.fail_all(&format!("connection lost: {}", e));
                    self.report(ConnectionState::Connecting);
                    return Some(self.transition());
                }
            }
        }
    }

    fn route_inbound(&self, topic: &str, payload: &[u8]) -> Option<InboundMessage> {
        debug!(
            "Message arrived on {}: {}",
            topic,
            String::from_utf8_lossy(payload)
        );

        let message = self.routes.route(topic, payload);
        if message.is_none() {
            debug!("Ignoring message on unrouted topic {}", topic);
        }
        message
    }

    fn log_granted(&self, codes: &[SubscribeReasonCode]) {
        let granted: Vec<String> = self
            .routes
            .subscriptions()
            .into_iter()
            .zip(codes)
            .filter_map(|(topic, code)| match code {
                SubscribeReasonCode::Success(qos) => Some(format!("{} ({:?})", topic, qos)),
                SubscribeReasonCode::Failure => {
                    error!("Broker refused subscription to {}", topic);
                    None
                }
            })
            .collect();
        info!("Subscribed {}", granted.join(", "));
    }
}

async fn supervise(link: BrokerLink<Disconnected>, cancel: CancellationToken) {
    let mut connecting = link.connect();
    loop {
        let Some(connected) = connecting.establish(&cancel).await else {
            break;
        };
        let Some(dropped) = connected.run(&cancel).await else {
            break;
        };
        if !dropped.wait_retry(&cancel).await {
            break;
        }
        connecting = dropped;
    }
    info!("MQTT connection task stopped");
}

/// The single writer to the broker connection
pub struct ConnectionManager {
    client: Option<AsyncClient>,
    qos: QoS,
    publish_timeout: Duration,
    tracker: Arc<PublishTracker>,
    // enqueue-then-hand-over must happen atomically per publish
    publish_order: Mutex<()>,
    status_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// A manager with no broker that stays `Disconnected`
    pub fn unconfigured() -> Self {
        let (_status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            client: None,
            qos: QoS::AtLeastOnce,
            publish_timeout: Duration::ZERO,
            tracker: Arc::new(PublishTracker::new()),
            publish_order: Mutex::new(()),
            status_rx,
        }
    }

    /// Starts the connection task if a broker url is configured
    pub fn spawn(
        broker: &BrokerConfig,
        topics: &TopicConfig,
        inbound_tx: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) -> Result<(Self, Option<JoinHandle<()>>), BridgeError> {
        let Some(url) = broker.url.as_deref() else {
            warn!("MQTT broker url not set; MQTT client will not start");
            return Ok((Self::unconfigured(), None));
        };

        let address = BrokerAddress::parse(url)?;
        let client_id = broker.resolved_client_id();
        let qos = qos_from_level(broker.qos_level());
        let (client, eventloop) = AsyncClient::new(
            mqtt_options(broker, &address, &client_id),
            CLIENT_CHANNEL_CAPACITY,
        );
        let (status_tx, status_rx) = watch::channel(ConnectionState::Disconnected);
        let tracker = Arc::new(PublishTracker::new());

        let link = BrokerLink::create(
            client.clone(),
            eventloop,
            InboundRoutes::new(topics),
            qos,
            Duration::from_secs(broker.reconnect_interval_secs),
            inbound_tx,
            tracker.clone(),
            status_tx,
        );

        info!(
            "Connecting to MQTT broker {}:{} as {} (QoS {:?})",
            address.host, address.port, client_id, qos
        );
        let task = tokio::spawn(supervise(link, cancel));

        Ok((
            Self {
                client: Some(client),
                qos,
                publish_timeout: Duration::from_secs(broker.publish_timeout_secs),
                tracker,
                publish_order: Mutex::new(()),
                status_rx,
            },
            Some(task),
        ))
    }

    pub fn state(&self) -> ConnectionState {
        *self.status_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.status_rx.clone()
    }
}

#[async_trait]
impl CommandPublisher for ConnectionManager {
    fn check_available(&self) -> Result<(), BridgeError> {
        if self.client.is_none() {
            return Err(BridgeError::UnconfiguredTransport);
        }
        match self.state() {
            ConnectionState::Connected => Ok(()),
            state => Err(BridgeError::TransportDown(format!(
                "connection is {:?}",
                state
            ))),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BridgeError> {
        self.check_available()?;
        let client = self
            .client
            .as_ref()
            .ok_or(BridgeError::UnconfiguredTransport)?;

        let completion = {
            let _order = self.publish_order.lock().await;
            let completion = self.tracker.enqueue(self.qos);
            if let Err(e) = client.publish(topic, self.qos, false, payload).await {
                self.tracker.cancel_last();
                return Err(publish_failed(topic, e.to_string()));
            }
            completion
        };

        match tokio::time::timeout(self.publish_timeout, completion).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(publish_failed(topic, reason)),
            Ok(Err(_)) => Err(publish_failed(topic, "publish tracking was dropped".to_string())),
            Err(_) => Err(publish_failed(
                topic,
                format!(
                    "no broker acknowledgement within {:?}",
                    self.publish_timeout
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn routes() -> InboundRoutes {
        InboundRoutes::new(&TopicConfig::default())
    }

    #[test]
    fn routes_telemetry_and_acks() {
        let routes = routes();
        assert_eq!(
            routes.route("aluna/telemetry", b"{}"),
            Some(InboundMessage::Telemetry(b"{}".to_vec()))
        );
        assert_eq!(
            routes.route("aluna/devices/sensor-7/ack", b"x"),
            Some(InboundMessage::Ack {
                topic: "aluna/devices/sensor-7/ack".to_string(),
                payload: b"x".to_vec()
            })
        );
        assert_eq!(routes.route("aluna/devices/sensor-7/extra/ack", b"x"), None);
        assert_eq!(routes.route("aluna/telemetry/extra", b"x"), None);
    }

    #[test]
    fn subscriptions_use_the_normalized_ack_filter() {
        let routes = InboundRoutes::new(&TopicConfig {
            ack_pattern: "aluna/devices/<deviceId>/ack".to_string(),
            ..TopicConfig::default()
        });
        assert_eq!(
            routes.subscriptions(),
            vec!["aluna/telemetry".to_string(), "aluna/devices/+/ack".to_string()]
        );
    }

    #[test]
    fn qos_levels() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn missing_url_stays_disconnected_and_refuses_to_publish() {
        let (tx, _rx) = mpsc::channel(1);
        let (manager, task) = ConnectionManager::spawn(
            &BrokerConfig::default(),
            &TopicConfig::default(),
            tx,
            CancellationToken::new(),
        )
        .unwrap();

        assert!(task.is_none());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(matches!(
            manager.publish("aluna/commands/d1/fan", b"{}".to_vec()).await,
            Err(BridgeError::UnconfiguredTransport)
        ));
    }

    #[tokio::test]
    async fn invalid_url_is_a_config_error() {
        let (tx, _rx) = mpsc::channel(1);
        let broker = BrokerConfig {
            url: Some("ws://broker".to_string()),
            ..BrokerConfig::default()
        };
        let result =
            ConnectionManager::spawn(&broker, &TopicConfig::default(), tx, CancellationToken::new());
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn publishing_without_a_connection_fails_fast() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let broker = BrokerConfig {
            url: Some("mqtt://127.0.0.1:1".to_string()),
            ..BrokerConfig::default()
        };
        let (manager, task) =
            ConnectionManager::spawn(&broker, &TopicConfig::default(), tx, cancel.clone())
                .unwrap();

        assert!(matches!(
            manager.publish("aluna/commands/d1/fan", b"{}".to_vec()).await,
            Err(BridgeError::TransportDown(_))
        ));

        cancel.cancel();
        task.unwrap().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    /// Reads one MQTT packet: (first header byte, body)
    async fn read_packet(socket: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = socket.read_u8().await.unwrap();
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await.unwrap();
            remaining |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        socket.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    fn subscribed_filter(body: &[u8]) -> String {
        // packet id (2), filter length (2), filter, options
        let len = u16::from_be_bytes([body[2], body[3]]) as usize;
        String::from_utf8(body[4..4 + len].to_vec()).unwrap()
    }

    async fn wait_for_state(
        states: &mut watch::Receiver<ConnectionState>,
        state: ConnectionState,
    ) {
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connects_subscribes_routes_publishes_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker = BrokerConfig {
            url: Some(format!("mqtt://127.0.0.1:{}", listener.local_addr().unwrap().port())),
            reconnect_interval_secs: 1,
            ..BrokerConfig::default()
        };
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let (manager, task) =
            ConnectionManager::spawn(&broker, &TopicConfig::default(), tx, cancel.clone())
                .unwrap();
        let manager = Arc::new(manager);
        let mut states = manager.watch_state();

        let (mut socket, _) = listener.accept().await.unwrap();
        let (connect, _) = read_packet(&mut socket).await;
        assert_eq!(connect >> 4, 1);
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        wait_for_state(&mut states, ConnectionState::Connected).await;

        let mut filters = Vec::new();
        for _ in 0..2 {
            let (header, body) = read_packet(&mut socket).await;
            assert_eq!(header, 0x82);
            filters.push(subscribed_filter(&body));
        }
        filters.sort();
        assert_eq!(filters, vec!["aluna/devices/+/ack", "aluna/telemetry"]);

        // broker -> bridge: QoS 0 publish on the telemetry topic
        let mut publish = vec![0x30, 19, 0x00, 15];
        publish.extend_from_slice(b"aluna/telemetry");
        publish.extend_from_slice(b"{}");
        socket.write_all(&publish).await.unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(inbound, Some(InboundMessage::Telemetry(b"{}".to_vec())));

        // bridge -> broker: completes only after our PUBACK
        let publisher = manager.clone();
        let outcome = tokio::spawn(async move {
            publisher
                .publish("aluna/commands/d1/fan", b"{}".to_vec())
                .await
        });
        let (header, body) = read_packet(&mut socket).await;
        assert_eq!(header & 0xf6, 0x32);
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let pkid = [body[2 + topic_len], body[3 + topic_len]];
        assert!(!outcome.is_finished());
        socket
            .write_all(&[0x40, 0x02, pkid[0], pkid[1]])
            .await
            .unwrap();
        assert!(outcome.await.unwrap().is_ok());

        drop(socket);
        wait_for_state(&mut states, ConnectionState::Connecting).await;
        let dropped_at = tokio::time::Instant::now();

        let (_second, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert!(dropped_at.elapsed() >= Duration::from_millis(900));
        assert_eq!(manager.state(), ConnectionState::Connecting);

        cancel.cancel();
        task.unwrap().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}

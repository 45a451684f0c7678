//! Live event stream for one external consumer (e.g. a server-sent-events
//! endpoint). Bus events are queued without loss and interleaved with a
//! periodic keep-alive; dropping the stream unsubscribes from the bus.

use super::events::{EventBus, Subscription};
use crate::model::{now_ms, Acknowledgement, Millis, TelemetryReading};
use color_eyre::eyre::eyre;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Telemetry(TelemetryReading),
    Ack(Acknowledgement),
    KeepAlive(Millis),
}

impl StreamEvent {
    /// Server-sent-events frame for this event
    pub fn to_sse(&self) -> String {
        match self {
            StreamEvent::Connected => ": connected\n\n".to_string(),
            StreamEvent::KeepAlive(at) => format!(": keep-alive {}\n\n", at),
            StreamEvent::Telemetry(reading) => frame("telemetry", serde_json::to_string(reading)),
            StreamEvent::Ack(ack) => frame("ack", serde_json::to_string(ack)),
        }
    }
}

fn frame(event: &str, data: serde_json::Result<String>) -> String {
    format!("event: {}\ndata: {}\n\n", event, data.unwrap_or_default())
}

pub struct LiveStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    subscriptions: Vec<Subscription>,
    keep_alive: CancellationToken,
}

impl LiveStream {
    /// Subscribes to telemetry and acks. Must be called inside a tokio runtime
    pub fn open(bus: &EventBus, keep_alive: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(StreamEvent::Connected);

        let telemetry_tx = tx.clone();
        let telemetry = bus.subscribe_telemetry(move |reading| {
            telemetry_tx
                .send(StreamEvent::Telemetry(reading.clone()))
                .map_err(|_| eyre!("live stream receiver is gone"))
        });

        let ack_tx = tx.clone();
        let ack = bus.subscribe_ack(move |ack| {
            ack_tx
                .send(StreamEvent::Ack(ack.clone()))
                .map_err(|_| eyre!("live stream receiver is gone"))
        });

        let token = CancellationToken::new();
        tokio::spawn(keep_alive_loop(tx, keep_alive, token.clone()));
        debug!("Live stream opened");

        Self {
            rx,
            subscriptions: vec![telemetry, ack],
            keep_alive: token,
        }
    }

    /// Next event, `None` once closed
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Unsubscribes and stops the keep-alive; already queued events can
    /// still be drained with `next`
    pub fn close(&mut self) {
        for subscription in &mut self.subscriptions {
            subscription.unsubscribe();
        }
        self.keep_alive.cancel();
        self.rx.close();
    }
}

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.close();
        debug!("Live stream closed");
    }
}

async fn keep_alive_loop(
    tx: mpsc::UnboundedSender<StreamEvent>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {
                if tx.send(StreamEvent::KeepAlive(now_ms())).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> TelemetryReading {
        TelemetryReading {
            device_id: "d1".to_string(),
            temperature: 21.5,
            humidity: 40.0,
            timestamp: 7,
        }
    }

    fn ack() -> Acknowledgement {
        Acknowledgement {
            request_id: "r1".to_string(),
            device_id: "d1".to_string(),
            status: "ok".to_string(),
            received_at: 8,
            message: None,
        }
    }

    #[tokio::test]
    async fn forwards_bus_events_in_order() {
        let bus = EventBus::new();
        let mut stream = LiveStream::open(&bus, Duration::from_secs(60));

        bus.publish_telemetry(&reading());
        bus.publish_ack(&ack());

        assert_eq!(stream.next().await, Some(StreamEvent::Connected));
        assert_eq!(stream.next().await, Some(StreamEvent::Telemetry(reading())));
        assert_eq!(stream.next().await, Some(StreamEvent::Ack(ack())));
    }

    #[tokio::test]
    async fn emits_keep_alives() {
        let bus = EventBus::new();
        let mut stream = LiveStream::open(&bus, Duration::from_millis(20));

        assert_eq!(stream.next().await, Some(StreamEvent::Connected));
        let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap();
        assert!(matches!(next, Some(StreamEvent::KeepAlive(_))));
    }

    #[tokio::test]
    async fn dropping_the_stream_unsubscribes() {
        let bus = EventBus::new();
        let stream = LiveStream::open(&bus, Duration::from_secs(60));
        assert_eq!(bus.telemetry_subscribers(), 1);
        assert_eq!(bus.ack_subscribers(), 1);

        drop(stream);
        assert_eq!(bus.telemetry_subscribers(), 0);
        assert_eq!(bus.ack_subscribers(), 0);
        bus.publish_telemetry(&reading());
    }

    #[tokio::test]
    async fn two_streams_each_get_every_event() {
        let bus = EventBus::new();
        let mut first = LiveStream::open(&bus, Duration::from_secs(60));
        let mut second = LiveStream::open(&bus, Duration::from_secs(60));

        bus.publish_telemetry(&reading());
        second.close();
        bus.publish_ack(&ack());

        assert_eq!(first.next().await, Some(StreamEvent::Connected));
        assert_eq!(first.next().await, Some(StreamEvent::Telemetry(reading())));
        assert_eq!(first.next().await, Some(StreamEvent::Ack(ack())));

        assert_eq!(second.next().await, Some(StreamEvent::Connected));
        assert_eq!(second.next().await, Some(StreamEvent::Telemetry(reading())));
        assert_eq!(second.next().await, None);
    }

    #[test]
    fn sse_frames() {
        assert_eq!(StreamEvent::Connected.to_sse(), ": connected\n\n");
        assert_eq!(StreamEvent::KeepAlive(5).to_sse(), ": keep-alive 5\n\n");
        assert_eq!(
            StreamEvent::Telemetry(reading()).to_sse(),
            "event: telemetry\ndata: {\"deviceId\":\"d1\",\"temperature\":21.5,\"humidity\":40.0,\"timestamp\":7}\n\n"
        );
        assert!(StreamEvent::Ack(ack()).to_sse().starts_with("event: ack\ndata: {\"requestId\":\"r1\""));
    }
}

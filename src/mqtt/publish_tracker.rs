//! Completion tracking for outbound publishes
//!
//! rumqttc hands publishes to its event loop and returns immediately. The
//! loop later reports `Outgoing::Publish(pkid)` in request order and the
//! broker answers with `PubAck` (QoS 1) or `PubComp` (QoS 2). Waiters are
//! queued in request order, bound to a packet id when the loop sends them,
//! and completed when the broker answers.
//!
//! After a connection error rumqttc replays whatever it had not finished
//! before any new request: publishes still waiting for `PubAck`/`PubRec`
//! are resent under their old packet id, and requests not yet written are
//! sent in order. Their waiters have already been failed, so those replays
//! are skipped instead of being bound to the next caller.

use rumqttc::QoS;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type PublishOutcome = Result<(), String>;

struct Waiter {
    qos: QoS,
    // QoS 2 publish already answered with PubRec; a reconnect replays PubRel
    received: bool,
    done: oneshot::Sender<PublishOutcome>,
}

impl Waiter {
    fn complete(self, outcome: PublishOutcome) {
        // receiver gone means the caller timed out; nothing left to notify
        let _ = self.done.send(outcome);
    }
}

#[derive(Default)]
struct TrackerState {
    queued: VecDeque<Waiter>,
    in_flight: HashMap<u16, Waiter>,
    // failed publishes rumqttc will resend under the same packet id
    replayed_pkids: HashSet<u16>,
    // failed publishes that were never written; resent before new requests
    replayed_unsent: usize,
}

#[derive(Default)]
pub struct PublishTracker {
    state: Mutex<TrackerState>,
}

impl PublishTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a publish about to be handed to the client. Callers must
    /// enqueue and hand over in the same order.
    pub fn enqueue(&self, qos: QoS) -> oneshot::Receiver<PublishOutcome> {
        let (done, rx) = oneshot::channel();
        self.state().queued.push_back(Waiter {
            qos,
            received: false,
            done,
        });
        rx
    }

    /// Withdraws the most recent waiter when the client refused the request
    pub fn cancel_last(&self) {
        self.state().queued.pop_back();
    }

    /// The event loop wrote a publish to the socket
    pub fn on_sent(&self, pkid: u16) {
        let mut state = self.state();
        if state.replayed_pkids.remove(&pkid) {
            debug!("Replayed in-flight publish {}", pkid);
            return;
        }
        if state.replayed_unsent > 0 {
            state.replayed_unsent -= 1;
            debug!("Replayed unsent publish {}", pkid);
            return;
        }

        let Some(waiter) = state.queued.pop_front() else {
            debug!("Untracked outgoing publish {}", pkid);
            return;
        };

        if waiter.qos == QoS::AtMostOnce {
            waiter.complete(Ok(()));
        } else if let Some(stale) = state.in_flight.insert(pkid, waiter) {
            warn!("Packet id {} reused before completion", pkid);
            stale.complete(Err(format!("packet id {} was reused", pkid)));
        }
    }

    /// The broker sent PubRec for a QoS 2 publish
    pub fn on_received(&self, pkid: u16) {
        if let Some(waiter) = self.state().in_flight.get_mut(&pkid) {
            waiter.received = true;
        }
    }

    /// The broker completed the handshake for `pkid`
    pub fn on_acknowledged(&self, pkid: u16) {
        if let Some(waiter) = self.state().in_flight.remove(&pkid) {
            waiter.complete(Ok(()));
        }
    }

    /// Fails every outstanding waiter, used when the connection drops
    pub fn fail_all(&self, reason: &str) {
        let waiters: Vec<Waiter> = {
            let mut guard = self.state();
            let state = &mut *guard;

            state.replayed_unsent += state.queued.len();
            for (pkid, waiter) in &state.in_flight {
                if !waiter.received {
                    state.replayed_pkids.insert(*pkid);
                }
            }

            state
                .queued
                .drain(..)
                .chain(state.in_flight.drain().map(|(_, waiter)| waiter))
                .collect()
        };

        if !waiters.is_empty() {
            warn!("Failing {} outstanding publishes: {}", waiters.len(), reason);
        }
        for waiter in waiters {
            waiter.complete(Err(reason.to_string()));
        }
    }

    pub fn outstanding(&self) -> usize {
        let state = self.state();
        state.queued.len() + state.in_flight.len()
    }
}

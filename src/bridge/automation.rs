//! Fan automation with a two-threshold (Schmitt trigger) rule
//!
//! ```text
//!            temp >= T_on  or  hum >= H_on   ──► ON
//!            temp <= T_off and hum <= H_off  ──► OFF
//!            anything in between             ──► no decision
//! ```
//!
//! The last issued state per device suppresses repeated commands. It is
//! recorded optimistically when a dispatch starts and rolled back when the
//! publish fails or the device acknowledges the command with an error, so
//! the next matching reading retries.

use super::dispatcher::{new_request_id, CommandDispatcher};
use crate::model::{Acknowledgement, CommandStatus, CommandType, FanState, TelemetryReading};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanThresholds {
    pub temp_on: f64,
    pub temp_off: f64,
    pub hum_on: f64,
    pub hum_off: f64,
}

impl Default for FanThresholds {
    fn default() -> Self {
        Self {
            temp_on: 28.0,
            temp_off: 26.0,
            hum_on: 70.0,
            hum_off: 65.0,
        }
    }
}

impl FanThresholds {
    /// Desired fan state for a reading, `None` inside the dead band
    pub fn decide(&self, reading: &TelemetryReading) -> Option<FanState> {
        if reading.temperature >= self.temp_on || reading.humidity >= self.hum_on {
            Some(FanState::On)
        } else if reading.temperature <= self.temp_off && reading.humidity <= self.hum_off {
            Some(FanState::Off)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct HysteresisState {
    last_issued: HashMap<String, FanState>,
    // latest automation request per device, cleared when its ack arrives
    awaiting_ack: HashMap<String, (String, FanState)>,
}

pub struct FanAutomation {
    thresholds: FanThresholds,
    state: Mutex<HysteresisState>,
    dispatcher: Arc<CommandDispatcher>,
}

impl FanAutomation {
    pub fn new(thresholds: FanThresholds, dispatcher: Arc<CommandDispatcher>) -> Self {
        Self {
            thresholds,
            state: Mutex::new(HysteresisState::default()),
            dispatcher,
        }
    }

    fn state(&self) -> MutexGuard<'_, HysteresisState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last state successfully issued (or currently being issued) for a device
    pub fn last_issued(&self, device_id: &str) -> Option<FanState> {
        self.state().last_issued.get(device_id).copied()
    }

    /// Evaluates a reading and, if the desired state changed, dispatches a
    /// `FAN_SET` in the background.
    ///
    /// The hysteresis state is updated before this returns, so a second
    /// identical reading never triggers a second dispatch. The returned handle
    /// completes once the publish handshake (and any rollback) is done.
    pub fn evaluate(self: &Arc<Self>, reading: &TelemetryReading) -> Option<JoinHandle<()>> {
        let desired = self.thresholds.decide(reading)?;
        let device_id = reading.device_id.clone();

        let request_id = new_request_id();
        let previous = {
            let mut state = self.state();
            let previous = state.last_issued.get(&device_id).copied();
            if previous == Some(desired) {
                return None;
            }
            state.last_issued.insert(device_id.clone(), desired);
            // registered before publishing: the ack may be processed before
            // the publish task resumes
            state
                .awaiting_ack
                .insert(device_id.clone(), (request_id.clone(), desired));
            previous
        };

        debug!(
            "Fan rule for {}: {:?} -> {} (t={}, h={})",
            device_id, previous, desired, reading.temperature, reading.humidity
        );

        let automation = Arc::clone(self);
        Some(tokio::spawn(async move {
            let speed = (desired == FanState::On).then_some(1);
            match automation
                .dispatcher
                .dispatch_as(
                    request_id.clone(),
                    &device_id,
                    CommandType::FanSet,
                    desired.as_value(),
                    speed,
                )
                .await
            {
                Ok(request_id) => {
                    info!(
                        "Fan rule sent {} for {} (request {})",
                        desired, device_id, request_id
                    );
                }
                Err(e) => {
                    warn!("Fan rule publish failed for {}: {}", device_id, e);
                    automation.rollback(&device_id, &request_id, desired, previous);
                }
            }
        }))
    }

    /// Forgets the issued state when the device rejects an automation command
    pub fn on_ack(&self, ack: &Acknowledgement) {
        let mut state = self.state();
        let desired = match state.awaiting_ack.get(&ack.device_id) {
            Some((request_id, desired)) if *request_id == ack.request_id => *desired,
            _ => return,
        };
        state.awaiting_ack.remove(&ack.device_id);

        if ack.outcome() == CommandStatus::Error
            && state.last_issued.get(&ack.device_id) == Some(&desired)
        {
            warn!(
                "Device {} rejected fan {} ({}), will retry on next reading",
                ack.device_id, desired, ack.status
            );
            state.last_issued.remove(&ack.device_id);
        }
    }

    fn rollback(
        &self,
        device_id: &str,
        request_id: &str,
        desired: FanState,
        previous: Option<FanState>,
    ) {
        let mut state = self.state();
        if matches!(state.awaiting_ack.get(device_id), Some((id, _)) if id == request_id) {
            state.awaiting_ack.remove(device_id);
        }
        // a newer decision may have replaced ours while the publish was in flight
        if state.last_issued.get(device_id) != Some(&desired) {
            return;
        }
        match previous {
            Some(previous) => state.last_issued.insert(device_id.to_string(), previous),
            None => state.last_issued.remove(device_id),
        };
    }
}

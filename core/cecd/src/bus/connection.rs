//! Bus connection manager.
//!
//! The adapter sits behind one mutex, which is the send lock: a frame
//! sequence is written while holding it, so writes from client commands,
//! corrections and the idle task never interleave on the wire.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BusAdapter, BusNotification, EventCategory, HandlerRegistry};
use crate::backoff::{sleep_unless, ReconnectPolicy};
use crate::cec::CecFrame;
use crate::error::{ConnectionError, SendError, TransmitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Connected,
    /// Loss observed; a reconnect has not started yet.
    Down,
    Reconnecting,
    /// Reconnect attempts exhausted. The daemon keeps running degraded.
    Lost,
    Closed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Connected => "connected",
            LinkState::Down => "down",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Lost => "lost",
            LinkState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendPolicy {
    /// Extra attempts after the first when the bus reports busy.
    pub retries: u32,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub frames: usize,
    pub attempts: u32,
}

pub struct BusConnection {
    adapter: Mutex<Box<dyn BusAdapter>>,
    registry: Arc<HandlerRegistry>,
    link: Mutex<LinkState>,
    send_policy: SendPolicy,
    reconnect_policy: ReconnectPolicy,
    frames_sent: AtomicU64,
}

impl BusConnection {
    pub fn connect(
        mut adapter: Box<dyn BusAdapter>,
        registry: Arc<HandlerRegistry>,
        send_policy: SendPolicy,
        reconnect_policy: ReconnectPolicy,
    ) -> Result<Self, ConnectionError> {
        adapter.open(Arc::clone(&registry))?;
        info!(adapter = %adapter.describe(), "CEC bus connected");
        Ok(Self {
            adapter: Mutex::new(adapter),
            registry,
            link: Mutex::new(LinkState::Connected),
            send_policy,
            reconnect_policy,
            frames_sent: AtomicU64::new(0),
        })
    }

    /// Installs the handler for `category`, replacing any previous one.
    pub fn register<F>(&self, category: EventCategory, handler: F) -> bool
    where
        F: Fn(&BusNotification) + Send + Sync + 'static,
    {
        self.registry.register(category, handler)
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn send(&self, frame: &CecFrame) -> Result<Ack, SendError> {
        self.send_all(std::slice::from_ref(frame))
    }

    /// Sends `frames` back to back under the send lock.
    pub fn send_all(&self, frames: &[CecFrame]) -> Result<Ack, SendError> {
        let mut adapter = self.lock_adapter();
        if self.link_state() != LinkState::Connected {
            return Err(SendError::Disconnected);
        }

        let mut attempts = 0;
        for frame in frames {
            attempts += self.transmit_with_retry(adapter.as_mut(), frame)?;
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Ack {
            frames: frames.len(),
            attempts,
        })
    }

    fn transmit_with_retry(
        &self,
        adapter: &mut dyn BusAdapter,
        frame: &CecFrame,
    ) -> Result<u32, SendError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match adapter.transmit(frame) {
                Ok(()) => {
                    debug!(%frame, attempt, "Frame transmitted");
                    return Ok(attempt);
                }
                Err(TransmitError::Busy(reason)) if attempt <= self.send_policy.retries => {
                    debug!(%frame, attempt, reason, "Bus busy; retrying");
                    thread::sleep(self.send_policy.retry_delay);
                }
                Err(TransmitError::Busy(reason)) => {
                    warn!(%frame, attempts = attempt, reason, "Bus stayed busy");
                    return Err(SendError::Exhausted {
                        attempts: attempt,
                        last_error: reason,
                    });
                }
                Err(TransmitError::Disconnected(reason)) => {
                    warn!(%frame, reason, "Adapter disconnected during send");
                    self.mark_down();
                    return Err(SendError::Disconnected);
                }
                Err(TransmitError::Failed(reason)) => {
                    warn!(%frame, reason, "Frame transmit failed");
                    return Err(SendError::Fatal(reason));
                }
            }
        }
    }

    /// Records an unexpected loss. A closed or lost link stays as it is.
    pub fn mark_down(&self) {
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if *link == LinkState::Connected {
            *link = LinkState::Down;
        }
    }

    /// Re-acquires the adapter with exponential backoff. On exhaustion the
    /// link is left `Lost`.
    pub fn reconnect(&self, stop: &AtomicBool) -> Result<(), ConnectionError> {
        {
            let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
            match *link {
                LinkState::Connected => return Ok(()),
                LinkState::Closed => return Err(ConnectionError::Interrupted),
                _ => *link = LinkState::Reconnecting,
            }
        }

        let policy = self.reconnect_policy;
        let mut last_error = String::from("no attempt made");
        for attempt in 1..=policy.attempts {
            let delay = policy.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to CEC adapter");
            if !sleep_unless(stop, delay) {
                self.set_link(LinkState::Closed);
                return Err(ConnectionError::Interrupted);
            }

            let mut adapter = self.lock_adapter();
            adapter.close();
            match adapter.open(Arc::clone(&self.registry)) {
                Ok(()) => {
                    self.set_link(LinkState::Connected);
                    info!(attempt, "CEC bus reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "Reconnect attempt failed");
                    last_error = err.to_string();
                }
            }
        }

        self.set_link(LinkState::Lost);
        warn!(attempts = policy.attempts, "Giving up on the CEC adapter; running degraded");
        Err(ConnectionError::ReconnectExhausted {
            attempts: policy.attempts,
            last_error,
        })
    }

    /// Releases the hardware. Safe to call more than once.
    pub fn disconnect(&self) {
        let mut adapter = self.lock_adapter();
        if self.link_state() == LinkState::Closed {
            return;
        }
        adapter.close();
        self.set_link(LinkState::Closed);
        info!("CEC bus disconnected");
    }

    fn set_link(&self, state: LinkState) {
        *self.link.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn lock_adapter(&self) -> MutexGuard<'_, Box<dyn BusAdapter>> {
        self.adapter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeBus;

    fn policies() -> (SendPolicy, ReconnectPolicy) {
        (
            SendPolicy {
                retries: 2,
                retry_delay: Duration::from_millis(1),
            },
            ReconnectPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
            },
        )
    }

    fn connect(bus: &FakeBus) -> BusConnection {
        let (send, reconnect) = policies();
        BusConnection::connect(bus.adapter(), Arc::new(HandlerRegistry::new()), send, reconnect)
            .unwrap()
    }

    fn frame(text: &str) -> CecFrame {
        text.parse().unwrap()
    }

    #[test]
    fn connect_fails_when_adapter_is_absent() {
        let bus = FakeBus::new();
        bus.fail_opens(1);
        let (send, reconnect) = policies();
        let result =
            BusConnection::connect(bus.adapter(), Arc::new(HandlerRegistry::new()), send, reconnect);
        assert!(matches!(result, Err(ConnectionError::Unavailable(_))));
    }

    #[test]
    fn busy_bus_is_retried_within_budget() {
        let bus = FakeBus::new();
        let connection = connect(&bus);
        bus.push_transmit_error(TransmitError::Busy("nack".to_string()));
        bus.push_transmit_error(TransmitError::Busy("nack".to_string()));

        let ack = connection.send(&frame("15:44:41")).unwrap();
        assert_eq!(ack.attempts, 3);
        assert_eq!(bus.sent(), vec!["15:44:41"]);
        assert_eq!(connection.frames_sent(), 1);
    }

    #[test]
    fn busy_bus_surfaces_after_exhaustion() {
        let bus = FakeBus::new();
        let connection = connect(&bus);
        for _ in 0..3 {
            bus.push_transmit_error(TransmitError::Busy("nack".to_string()));
        }

        let err = connection.send(&frame("15:44:41")).unwrap_err();
        assert_eq!(
            err,
            SendError::Exhausted {
                attempts: 3,
                last_error: "nack".to_string()
            }
        );
        assert!(bus.sent().is_empty());
        assert_eq!(connection.link_state(), LinkState::Connected);
    }

    #[test]
    fn disconnect_during_send_marks_link_down() {
        let bus = FakeBus::new();
        let connection = connect(&bus);
        bus.push_transmit_error(TransmitError::Disconnected("broken pipe".to_string()));

        assert_eq!(connection.send(&frame("10:36")), Err(SendError::Disconnected));
        assert_eq!(connection.link_state(), LinkState::Down);
        assert_eq!(connection.send(&frame("10:36")), Err(SendError::Disconnected));
    }

    #[test]
    fn sequences_are_sent_in_order() {
        let bus = FakeBus::new();
        let connection = connect(&bus);
        let ack = connection
            .send_all(&[frame("1f:84:11:00:01"), frame("1f:82:11:00")])
            .unwrap();
        assert_eq!(ack.frames, 2);
        assert_eq!(bus.sent(), vec!["1f:84:11:00:01", "1f:82:11:00"]);
    }

    #[test]
    fn reconnect_recovers_after_failed_attempts() {
        let bus = FakeBus::new();
        let connection = connect(&bus);
        connection.mark_down();
        bus.fail_opens(2);

        let stop = AtomicBool::new(false);
        connection.reconnect(&stop).unwrap();
        assert_eq!(connection.link_state(), LinkState::Connected);
        assert_eq!(bus.opens(), 4);
        assert!(connection.send(&frame("10:04")).is_ok());
    }

    #[test]
    fn reconnect_exhaustion_leaves_link_lost() {
        let bus = FakeBus::new();
        let connection = connect(&bus);
        connection.mark_down();
        bus.fail_opens(10);

        let stop = AtomicBool::new(false);
        let err = connection.reconnect(&stop).unwrap_err();
        assert!(matches!(err, ConnectionError::ReconnectExhausted { attempts: 3, .. }));
        assert_eq!(connection.link_state(), LinkState::Lost);
        assert_eq!(connection.send(&frame("10:04")), Err(SendError::Disconnected));
    }

    #[test]
    fn disconnect_is_idempotent() {
        let bus = FakeBus::new();
        let connection = connect(&bus);
        connection.disconnect();
        connection.disconnect();
        assert_eq!(bus.closes(), 1);
        assert_eq!(connection.link_state(), LinkState::Closed);
    }
}

//! Channel liveness state machine.
//!
//! The transport integration layer is the single writer: it reports every
//! connect, drop and reconnect through explicit transition calls. Readers
//! (inbound buffer, admission gate, follow-up scheduler) only observe the
//! state. Transitions are serialized; subscriber callbacks run after the state
//! write completes, in registration-id order, and must not transition the
//! machine themselves.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::delivery_error::ConnectionTransitionError;
use crate::delivery_time::SharedDeliveryClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ConnectionState` values.
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Returns true when this state can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        match next {
            Self::Disconnected => true,
            Self::Connecting => matches!(self, Self::Disconnected | Self::Reconnecting),
            Self::Connected => self != Self::Connected,
            Self::Reconnecting => true,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback fired with `(new_state, old_state)` after each applied transition.
pub type ConnectionStateCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Result of one transition request.
pub struct ConnectionTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub applied: bool,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Point-in-time view of the connection for observability.
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub last_connected_unix_ms: Option<u64>,
    pub last_transition_unix_ms: Option<u64>,
    pub reconnect_attempts: u64,
    pub last_reason: Option<String>,
    pub active_listeners: Vec<String>,
    pub subscriber_count: usize,
}

struct ConnectionInner {
    state: ConnectionState,
    last_connected_unix_ms: Option<u64>,
    last_transition_unix_ms: Option<u64>,
    reconnect_attempts: u64,
    last_reason: Option<String>,
    listeners: BTreeSet<String>,
    subscribers: BTreeMap<String, ConnectionStateCallback>,
}

/// Process-wide liveness tracker injected into every delivery component.
pub struct ConnectionStateMachine {
    inner: Mutex<ConnectionInner>,
    transition_lock: Mutex<()>,
    clock: SharedDeliveryClock,
}

impl fmt::Debug for ConnectionStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStateMachine")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ConnectionStateMachine {
    pub fn new(clock: SharedDeliveryClock) -> Self {
        Self {
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Disconnected,
                last_connected_unix_ms: None,
                last_transition_unix_ms: None,
                reconnect_attempts: 0,
                last_reason: None,
                listeners: BTreeSet::new(),
                subscribers: BTreeMap::new(),
            }),
            transition_lock: Mutex::new(()),
            clock,
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock_unpoisoned(&self.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u64 {
        lock_unpoisoned(&self.inner).reconnect_attempts
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = lock_unpoisoned(&self.inner);
        ConnectionSnapshot {
            state: inner.state,
            last_connected_unix_ms: inner.last_connected_unix_ms,
            last_transition_unix_ms: inner.last_transition_unix_ms,
            reconnect_attempts: inner.reconnect_attempts,
            last_reason: inner.last_reason.clone(),
            active_listeners: inner.listeners.iter().cloned().collect(),
            subscriber_count: inner.subscribers.len(),
        }
    }

    pub fn set_connecting(&self) -> Result<ConnectionTransition, ConnectionTransitionError> {
        self.transition(ConnectionState::Connecting, None)
    }

    /// Marks the channel usable, resets the reconnect counter and notifies
    /// subscribers (which includes the inbound drain trigger).
    pub fn set_connected(&self) -> Result<ConnectionTransition, ConnectionTransitionError> {
        self.transition(ConnectionState::Connected, None)
    }

    pub fn set_reconnecting(
        &self,
        reason: &str,
    ) -> Result<ConnectionTransition, ConnectionTransitionError> {
        self.transition(ConnectionState::Reconnecting, Some(reason))
    }

    pub fn set_disconnected(
        &self,
        reason: &str,
    ) -> Result<ConnectionTransition, ConnectionTransitionError> {
        self.transition(ConnectionState::Disconnected, Some(reason))
    }

    /// Records a transport listener token. Returns false when `id` is already
    /// registered so callers never attach a second listener across reconnects.
    pub fn register_listener(&self, id: &str) -> bool {
        let id = id.trim();
        if id.is_empty() {
            return false;
        }
        let inserted = lock_unpoisoned(&self.inner).listeners.insert(id.to_string());
        if !inserted {
            tracing::debug!(listener_id = id, "transport listener already registered");
        }
        inserted
    }

    pub fn unregister_listener(&self, id: &str) -> bool {
        lock_unpoisoned(&self.inner).listeners.remove(id.trim())
    }

    pub fn has_listener(&self, id: &str) -> bool {
        lock_unpoisoned(&self.inner).listeners.contains(id.trim())
    }

    /// Subscribes `callback` under `id`. Re-registration under the same id is
    /// a no-op and returns false.
    pub fn on_state_change(&self, id: &str, callback: ConnectionStateCallback) -> bool {
        let id = id.trim();
        if id.is_empty() {
            return false;
        }
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.subscribers.contains_key(id) {
            return false;
        }
        inner.subscribers.insert(id.to_string(), callback);
        true
    }

    pub fn remove_state_change(&self, id: &str) -> bool {
        lock_unpoisoned(&self.inner)
            .subscribers
            .remove(id.trim())
            .is_some()
    }

    fn transition(
        &self,
        next: ConnectionState,
        reason: Option<&str>,
    ) -> Result<ConnectionTransition, ConnectionTransitionError> {
        let _serialized = lock_unpoisoned(&self.transition_lock);
        let now_unix_ms = self.clock.now_unix_ms();
        let (previous, reconnect_attempts, callbacks) = {
            let mut inner = lock_unpoisoned(&self.inner);
            let previous = inner.state;
            let repeat_reconnect =
                previous == ConnectionState::Reconnecting && next == ConnectionState::Reconnecting;
            if previous == next && !repeat_reconnect {
                return Ok(ConnectionTransition {
                    from: previous,
                    to: next,
                    applied: false,
                    reconnect_attempts: inner.reconnect_attempts,
                });
            }
            if !previous.can_transition_to(next) {
                return Err(ConnectionTransitionError::Invalid {
                    from: previous,
                    to: next,
                });
            }

            inner.state = next;
            inner.last_transition_unix_ms = Some(now_unix_ms);
            inner.last_reason = reason.map(str::to_string);
            match next {
                ConnectionState::Connected => {
                    inner.reconnect_attempts = 0;
                    inner.last_connected_unix_ms = Some(now_unix_ms);
                }
                ConnectionState::Reconnecting => {
                    inner.reconnect_attempts = inner.reconnect_attempts.saturating_add(1);
                }
                ConnectionState::Connecting | ConnectionState::Disconnected => {}
            }
            let callbacks = inner
                .subscribers
                .values()
                .cloned()
                .collect::<Vec<ConnectionStateCallback>>();
            (previous, inner.reconnect_attempts, callbacks)
        };

        tracing::info!(
            from = previous.as_str(),
            to = next.as_str(),
            reconnect_attempts,
            reason = reason.unwrap_or(""),
            "connection state changed"
        );
        for callback in callbacks {
            callback(next, previous);
        }

        Ok(ConnectionTransition {
            from: previous,
            to: next,
            applied: true,
            reconnect_attempts,
        })
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::delivery_time::ManualDeliveryClock;

    fn machine() -> (Arc<ManualDeliveryClock>, ConnectionStateMachine) {
        let clock = Arc::new(ManualDeliveryClock::new(1_000));
        let machine = ConnectionStateMachine::new(clock.clone());
        (clock, machine)
    }

    #[test]
    fn unit_initial_state_is_disconnected() {
        let (_clock, machine) = machine();
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(!machine.is_connected());
        assert_eq!(machine.reconnect_attempts(), 0);
        assert_eq!(machine.snapshot().last_connected_unix_ms, None);
    }

    #[test]
    fn functional_reconnect_counter_increments_and_resets_on_connect() {
        let (clock, machine) = machine();
        machine.set_connecting().expect("connecting");
        machine.set_connected().expect("connected");
        machine.set_reconnecting("socket closed").expect("reconnecting");
        machine.set_reconnecting("retry").expect("reconnecting again");
        assert_eq!(machine.reconnect_attempts(), 2);
        assert_eq!(
            machine.snapshot().last_reason.as_deref(),
            Some("retry")
        );

        clock.set(9_000);
        let transition = machine.set_connected().expect("connected");
        assert!(transition.applied);
        assert_eq!(transition.from, ConnectionState::Reconnecting);
        assert_eq!(machine.reconnect_attempts(), 0);
        assert_eq!(machine.snapshot().last_connected_unix_ms, Some(9_000));
    }

    #[test]
    fn unit_connected_to_connecting_is_rejected() {
        let (_clock, machine) = machine();
        machine.set_connected().expect("connected");
        let error = machine.set_connecting().expect_err("must reject");
        assert_eq!(
            error,
            ConnectionTransitionError::Invalid {
                from: ConnectionState::Connected,
                to: ConnectionState::Connecting,
            }
        );
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn functional_callbacks_receive_new_and_old_state() {
        let (_clock, machine) = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        assert!(machine.on_state_change(
            "recorder",
            Arc::new(move |new, old| lock_unpoisoned(&sink).push((new, old))),
        ));

        machine.set_reconnecting("boot").expect("reconnecting");
        machine.set_connected().expect("connected");
        machine.set_disconnected("fatal").expect("disconnected");

        assert_eq!(
            *lock_unpoisoned(&seen),
            vec![
                (ConnectionState::Reconnecting, ConnectionState::Disconnected),
                (ConnectionState::Connected, ConnectionState::Reconnecting),
                (ConnectionState::Disconnected, ConnectionState::Connected),
            ]
        );
    }

    #[test]
    fn regression_duplicate_subscription_id_does_not_double_fire() {
        let (_clock, machine) = machine();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = fired.clone();
            machine.on_state_change(
                "drain",
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        machine.set_connected().expect("connected");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(machine.snapshot().subscriber_count, 1);
    }

    #[test]
    fn regression_set_connected_twice_fires_callbacks_once() {
        let (_clock, machine) = machine();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        machine.on_state_change(
            "drain",
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        machine.set_connected().expect("connected");
        let second = machine.set_connected().expect("no-op");
        assert!(!second.applied);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn regression_listener_registration_is_idempotent() {
        let (_clock, machine) = machine();
        assert!(machine.register_listener("transport-messages"));
        assert!(!machine.register_listener("transport-messages"));
        assert!(!machine.register_listener("transport-messages"));
        assert!(machine.unregister_listener("transport-messages"));
        assert!(!machine.has_listener("transport-messages"));
        assert!(machine.snapshot().active_listeners.is_empty());
        assert!(!machine.unregister_listener("transport-messages"));
    }

    #[test]
    fn unit_blank_ids_are_rejected() {
        let (_clock, machine) = machine();
        assert!(!machine.register_listener("  "));
        assert!(!machine.on_state_change("", Arc::new(|_, _| {})));
    }
}

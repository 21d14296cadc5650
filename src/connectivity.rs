//! Network reachability as reported by the host.
//!
//! The monitor never probes. The host calls [`ConnectivityMonitor::on_connectivity_change`]
//! whenever the platform reports a change, and interested parties either read
//! the current state or subscribe to transitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(&self) -> bool {
        matches!(self, ConnectivityState::Online)
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => f.write_str("online"),
            ConnectivityState::Offline => f.write_str("offline"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    WentOnline,
    WentOffline,
}

const EVENT_CAPACITY: usize = 16;

/// Cheap to clone; all clones share one state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: watch::Sender<ConnectivityState>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner { state, events }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.inner.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Host hook. Returns the transition, if the new state differs.
    pub fn on_connectivity_change(&self, next: ConnectivityState) -> Option<ConnectivityEvent> {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !changed {
            return None;
        }
        let event = match next {
            ConnectivityState::Online => ConnectivityEvent::WentOnline,
            ConnectivityState::Offline => ConnectivityEvent::WentOffline,
        };
        info!(state = %next, "connectivity changed");
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
        Some(event)
    }

    pub fn set_online(&self) -> Option<ConnectivityEvent> {
        self.on_connectivity_change(ConnectivityState::Online)
    }

    pub fn set_offline(&self) -> Option<ConnectivityEvent> {
        self.on_connectivity_change(ConnectivityState::Offline)
    }

    /// Transition events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.inner.events.subscribe()
    }

    /// Current-state watcher, for status indicators.
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_emit_events_once() {
        let monitor = ConnectivityMonitor::new(ConnectivityState::Online);
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.set_online(), None);
        assert_eq!(monitor.set_offline(), Some(ConnectivityEvent::WentOffline));
        assert_eq!(monitor.set_offline(), None);
        assert!(!monitor.is_online());
        assert_eq!(monitor.set_online(), Some(ConnectivityEvent::WentOnline));

        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::WentOffline);
        assert_eq!(rx.recv().await.unwrap(), ConnectivityEvent::WentOnline);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = ConnectivityMonitor::new(ConnectivityState::Offline);
        let b = a.clone();
        let mut watcher = a.watch();
        b.set_online();
        assert!(a.is_online());
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), ConnectivityState::Online);
    }
}

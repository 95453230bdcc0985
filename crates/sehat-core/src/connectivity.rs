//! Connectivity monitor
//!
//! Normalizes the platform's raw reachability signal into `Online` /
//! `Offline` and fans transitions out to subscribers. Duplicate reports
//! of the current state are suppressed, so subscribers see at most one
//! notification per actual change, and a transition to `Online` wakes
//! the sync engine without any user action.

use tokio::sync::watch;

/// Normalized network reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Online,
    Offline,
}

impl ConnState {
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Observes reachability and signals the sync engine
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnState>,
}

impl ConnectivityMonitor {
    /// Create a monitor with the given initial state
    #[must_use]
    pub fn new(initial: ConnState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// The current normalized state
    #[must_use]
    pub fn current_state(&self) -> ConnState {
        *self.tx.borrow()
    }

    /// Feed a raw reachability observation from the platform.
    ///
    /// Reporting the state that is already current is a no-op.
    pub fn report(&self, state: ConnState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(?state, "connectivity changed");
        }
    }

    /// Subscribe to state-change notifications
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnState::Offline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_change_state() {
        let monitor = ConnectivityMonitor::new(ConnState::Offline);
        assert_eq!(monitor.current_state(), ConnState::Offline);

        monitor.report(ConnState::Online);
        assert_eq!(monitor.current_state(), ConnState::Online);
    }

    #[tokio::test]
    async fn duplicate_reports_are_suppressed() {
        let monitor = ConnectivityMonitor::new(ConnState::Offline);
        let mut rx = monitor.subscribe();
        rx.mark_unchanged();

        monitor.report(ConnState::Offline);
        assert!(!rx.has_changed().unwrap());

        monitor.report(ConnState::Online);
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        monitor.report(ConnState::Online);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn online_transition_wakes_subscribers() {
        let monitor = ConnectivityMonitor::new(ConnState::Offline);
        let mut rx = monitor.subscribe();

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            *rx.borrow()
        });

        monitor.report(ConnState::Online);
        assert_eq!(waiter.await.unwrap(), ConnState::Online);
    }
}

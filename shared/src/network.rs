use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl Connectivity {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// Written by the shell whenever the platform reports a connectivity change.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    tx: watch::Sender<Connectivity>,
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new(Connectivity::Unknown)
    }
}

impl ConnectivityHandle {
    pub fn new(initial: Connectivity) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, state: Connectivity) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!(?state, "connectivity changed");
        }
    }

    pub fn current(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}

/// Turns a stream of connectivity changes into "came back online" triggers.
///
/// A change only counts once the link has stayed put for the debounce window,
/// so any burst of flapping yields at most one trigger. The callback runs once
/// per burst that settles connected after the link was down, either before the
/// burst or at some point during it. An outage shorter than the window still
/// triggers, since writes may have been queued while it lasted.
pub struct NetworkMonitor {
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    pub fn spawn<F>(mut rx: watch::Receiver<Connectivity>, debounce: Duration, on_connected: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        // Whatever the link is at registration counts as settled.
        let mut settled = *rx.borrow_and_update();

        let task = tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                let mut went_down = !rx.borrow_and_update().is_connected();

                loop {
                    tokio::select! {
                        res = rx.changed() => {
                            if res.is_err() {
                                return;
                            }
                            went_down |= !rx.borrow_and_update().is_connected();
                        }
                        () = tokio::time::sleep(debounce) => break,
                    }
                }

                let current = *rx.borrow_and_update();
                let was = settled;
                settled = current;

                if current.is_connected() && (!was.is_connected() || went_down) {
                    info!(from = ?was, went_down, "connectivity restored");
                    on_connected();
                }
            }
            debug!("connectivity source closed, monitor stopping");
        });

        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const DEBOUNCE: Duration = Duration::from_millis(500);

    fn counting_monitor(handle: &ConnectivityHandle) -> (NetworkMonitor, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let monitor = NetworkMonitor::spawn(handle.subscribe(), DEBOUNCE, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (monitor, count)
    }

    async fn settle() {
        tokio::time::sleep(DEBOUNCE * 4).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_per_reconnect() {
        let handle = ConnectivityHandle::new(Connectivity::Disconnected);
        let (_monitor, count) = counting_monitor(&handle);

        handle.set(Connectivity::Connected);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        handle.set(Connectivity::Connected);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "no transition, no trigger");

        handle.set(Connectivity::Disconnected);
        settle().await;
        handle.set(Connectivity::Connected);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_to_connected_counts_as_transition() {
        let handle = ConnectivityHandle::default();
        let (_monitor, count) = counting_monitor(&handle);

        handle.set(Connectivity::Connected);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn already_connected_at_registration_does_not_fire() {
        let handle = ConnectivityHandle::new(Connectivity::Connected);
        let (_monitor, count) = counting_monitor(&handle);

        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_collapses_to_single_trigger() {
        let handle = ConnectivityHandle::new(Connectivity::Disconnected);
        let (_monitor, count) = counting_monitor(&handle);

        for i in 0..10 {
            handle.set(if i % 2 == 0 {
                Connectivity::Connected
            } else {
                Connectivity::Disconnected
            });
            tokio::time::sleep(Duration::from_millis(90)).await;
        }
        handle.set(Connectivity::Connected);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_shorter_than_debounce_still_fires() {
        let handle = ConnectivityHandle::new(Connectivity::Connected);
        let (_monitor, count) = counting_monitor(&handle);

        handle.set(Connectivity::Disconnected);
        tokio::time::sleep(DEBOUNCE / 2).await;
        handle.set(Connectivity::Connected);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_while_connected_fires_once() {
        let handle = ConnectivityHandle::new(Connectivity::Connected);
        let (_monitor, count) = counting_monitor(&handle);

        for _ in 0..5 {
            handle.set(Connectivity::Disconnected);
            tokio::time::sleep(Duration::from_millis(40)).await;
            handle.set(Connectivity::Connected);
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flapping_that_ends_offline_never_fires() {
        let handle = ConnectivityHandle::new(Connectivity::Disconnected);
        let (_monitor, count) = counting_monitor(&handle);

        for i in 0..10 {
            handle.set(if i % 2 == 0 {
                Connectivity::Connected
            } else {
                Connectivity::Disconnected
            });
            tokio::time::sleep(Duration::from_millis(90)).await;
        }
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_monitor_ignores_changes() {
        let handle = ConnectivityHandle::new(Connectivity::Disconnected);
        let (monitor, count) = counting_monitor(&handle);

        monitor.stop();
        tokio::task::yield_now().await;
        handle.set(Connectivity::Connected);
        settle().await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_running());
    }
}

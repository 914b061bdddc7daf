//! Shared cancellation token for sessions and channels.
//!
//! Every session spawns a read loop and every server channel an accept loop;
//! both need an online flag, a stop signal their tasks can select on, and
//! storage for the `JoinHandle`s awaited during teardown. [`ShutdownToken`]
//! bundles the three.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

/// Coordinates shutdown of the background tasks owned by one session or channel.
pub struct ShutdownToken {
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    online: AtomicBool,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            stop_tx,
            stop_rx,
            online: AtomicBool::new(false),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// A new subscription to the stop signal, one per background task.
    ///
    /// Tasks hold their own receiver and check it in a `tokio::select!`
    /// branch alongside their I/O.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    /// Whether the stop signal has been sent.
    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    pub fn set_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    pub fn set_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Register a background task handle to be awaited on teardown.
    pub async fn add_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().await.push(handle);
    }

    /// Send the stop signal to all subscribers. Idempotent.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub fn signal_stop_and_go_offline(&self) {
        self.signal_stop();
        self.set_offline();
    }

    /// Await all registered background tasks, draining the handle list.
    /// Join errors (panics, cancellations) are ignored.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_not_online_and_not_stopped() {
        let token = ShutdownToken::new();
        assert!(!token.is_online());
        assert!(!token.is_stopped());
    }

    #[test]
    fn stop_signal_reaches_subscribers() {
        let token = ShutdownToken::new();
        let rx = token.subscribe();
        assert!(!*rx.borrow());

        token.signal_stop();
        assert!(*rx.borrow());

        // Subscribing after the fact sees the signal too.
        assert!(*token.subscribe().borrow());
    }

    #[test]
    fn signal_stop_is_idempotent() {
        let token = ShutdownToken::new();
        token.signal_stop();
        token.signal_stop();
        assert!(token.is_stopped());
    }

    #[test]
    fn stop_and_go_offline_does_both() {
        let token = ShutdownToken::new();
        token.set_online();
        token.signal_stop_and_go_offline();
        assert!(!token.is_online());
        assert!(token.is_stopped());
    }

    #[tokio::test]
    async fn join_all_drains_finished_tasks() {
        let token = ShutdownToken::new();
        let mut rx = token.subscribe();
        token
            .add_task(tokio::spawn(async move {
                let _ = rx.changed().await;
            }))
            .await;

        token.signal_stop();
        token.join_all().await;
        assert!(token.task_handles.lock().await.is_empty());
    }

    #[tokio::test]
    async fn join_all_on_empty_handle_list() {
        let token = ShutdownToken::new();
        token.join_all().await;
    }
}

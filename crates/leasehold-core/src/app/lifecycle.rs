//! Background loop handle shared by workers and the reclaimer.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A spawned loop plus the channel that tells it to stop.
///
/// - `shutdown()` で停止を要求し、ループの終了を待つ
/// - ループ側は `watch::Receiver` の変化で抜ける
pub(crate) struct LoopHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    pub(crate) fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(body(shutdown_rx));
        Self { shutdown_tx, join }
    }

    /// Request shutdown and wait for the loop to exit.
    ///
    /// An in-progress iteration finishes first; nothing is cancelled mid-way.
    pub(crate) async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        // ignore send error: the loop may already have exited
        let _ = self.shutdown_tx.send(true);
        self.join.await
    }
}

/// Wait for the next tick or a shutdown request. Returns false on shutdown.
pub(crate) async fn next_tick(
    ticker: &mut tokio::time::Interval,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        // 送るのは true だけ。sender の drop も停止扱い
        _ = shutdown_rx.changed() => false,
        _ = ticker.tick() => true,
    }
}

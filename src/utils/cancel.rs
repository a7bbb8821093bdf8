use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::trace;

use crate::Error;
use crate::ScanError;

/// First-of done/cancel/timeout selection.
///
/// Watches a cancel signal and an optional deadline on behalf of a blocking
/// operation. Whichever of the three fires first wins; the callback is
/// invoked exactly once, with [`ScanError::ClientCancel`] or
/// [`ScanError::ScanTimedOut`]. Completing or dropping the guard counts as
/// done and suppresses the callback.
pub struct CancelCb {
    done: Option<oneshot::Sender<()>>,
}

impl CancelCb {
    /// Spawn the watcher. `cancel` fires on an explicit signal only; a
    /// dropped sender disarms it.
    pub fn spawn<F>(
        cancel: oneshot::Receiver<()>,
        timeout: Option<Duration>,
        callb: F,
    ) -> Self
    where
        F: FnOnce(Error) + Send + 'static,
    {
        let (done_tx, mut done_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let cancelled = async {
                match cancel.await {
                    Ok(()) => {}
                    // sender dropped without cancelling; never fire
                    Err(_) => futures::future::pending::<()>().await,
                }
            };
            let expired = async {
                match timeout {
                    Some(t) => sleep(t).await,
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut done_rx => {
                    trace!("cancel watcher released");
                }
                _ = cancelled => callb(ScanError::ClientCancel.into()),
                _ = expired => callb(ScanError::ScanTimedOut.into()),
            }
        });

        CancelCb { done: Some(done_tx) }
    }

    /// Mark the guarded operation complete.
    pub fn done(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for CancelCb {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

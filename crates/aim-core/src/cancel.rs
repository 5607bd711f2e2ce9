use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation handle passed to every externally visible async
/// operation. Cloning shares the same signal.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the token is cancelled. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // Ok(..) means the value changed; Err(..) means all senders dropped,
        // which we treat as "never cancelled" and park forever.
        loop {
            match rx.changed().await {
                Ok(()) => {
                    if *rx.borrow() {
                        return;
                    }
                }
                Err(_) => {
                    futures::future::pending::<()>().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken").field("cancelled", &self.is_cancelled()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_future_resolves_after_cancel() {
        let tok = CancelToken::new();
        assert!(!tok.is_cancelled());
        let waiter = tok.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tok.cancel();
        handle.await.unwrap();
        assert!(tok.is_cancelled());
    }
}

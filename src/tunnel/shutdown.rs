use tokio::sync::watch;

pub type ShutdownRx = watch::Receiver<bool>;

/// Resolves once `rx` reads `true` or its sender is gone. A dropped sender
/// counts as shutdown.
pub async fn wait(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

pub fn is_set(rx: &ShutdownRx) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

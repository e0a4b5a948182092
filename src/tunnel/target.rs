use std::time::{Duration, Instant};

use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, mpsc, watch},
};

use crate::tunnel::{
    error::TunnelError,
    protocol::{self, Hello},
    shutdown::{self, ShutdownRx},
    stream::{BoxedStream, BoxedWriter},
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Server-side handle for one registered client: the write side of its command
/// connection plus a pool of data connections it has offered.
pub struct Target {
    id: u64,
    port: u16,
    cmd: Mutex<BoxedWriter>,
    queue_tx: mpsc::Sender<BoxedStream>,
    queue_rx: Mutex<mpsc::Receiver<BoxedStream>>,
    closed: watch::Sender<bool>,
    started: Instant,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("port", &self.port)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Target {
    pub fn new(id: u64, port: u16, cmd: BoxedWriter) -> Self {
        Self::with_capacity(id, port, cmd, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(id: u64, port: u16, cmd: BoxedWriter, capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(capacity.max(1));
        let (closed, _rx) = watch::channel(false);
        Self {
            id,
            port,
            cmd: Mutex::new(cmd),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
            closed,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Queue a data connection offered by the client.
    ///
    /// Never blocks. When the queue is full the connection is dropped (closing
    /// it) and `QueueFull` is returned.
    pub fn register_data_conn(&self, conn: BoxedStream) -> Result<(), TunnelError> {
        if self.is_closed() {
            drop(conn);
            return Err(TunnelError::TargetClosed);
        }
        match self.queue_tx.try_send(conn) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(conn)) => {
                drop(conn);
                Err(TunnelError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(conn)) => {
                drop(conn);
                Err(TunnelError::TargetClosed)
            }
        }
    }

    /// Ask the client for a data connection and wait for one to show up.
    ///
    /// Any queued connection satisfies any request; there is no correlation
    /// between a signal and the connection that answers it. The whole call,
    /// including waiting behind other requesters, is bounded by `timeout`.
    pub async fn request_connection(
        &self,
        timeout: Duration,
        cancel: &mut ShutdownRx,
    ) -> Result<BoxedStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::TargetClosed);
        }

        let wait = async {
            self.signal().await?;

            let mut rx = self.queue_rx.lock().await;
            // close() cannot drain while the lock is held elsewhere.
            if self.is_closed() {
                drain(&mut rx);
                return Err(TunnelError::TargetClosed);
            }
            let mut closed = self.closed.subscribe();
            tokio::select! {
                conn = rx.recv() => conn.ok_or(TunnelError::TargetClosed),
                _ = shutdown::wait(&mut closed) => {
                    drain(&mut rx);
                    Err(TunnelError::TargetClosed)
                }
            }
        };

        tokio::select! {
            res = tokio::time::timeout(timeout, wait) => match res {
                Ok(res) => res,
                Err(_) => Err(TunnelError::RequestTimeout),
            },
            _ = shutdown::wait(cancel) => Err(TunnelError::Cancelled),
        }
    }

    /// Write a handshake reply on the command connection.
    pub async fn send_hello(&self, hello: &Hello) -> Result<(), TunnelError> {
        let mut cmd = self.cmd.lock().await;
        protocol::write_hello(&mut *cmd, hello).await?;
        Ok(())
    }

    async fn signal(&self) -> Result<(), TunnelError> {
        let mut cmd = self.cmd.lock().await;
        if let Err(err) = protocol::write_data_request(&mut *cmd).await {
            drop(cmd);
            self.close();
            return Err(TunnelError::Transport(err));
        }
        Ok(())
    }

    /// Mark the target dead. Waiters are woken and queued connections dropped,
    /// by the current lock holder if a requester has the queue.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Ok(mut rx) = self.queue_rx.try_lock() {
            drain(&mut rx);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        shutdown::wait(&mut rx).await;
    }

    /// Best-effort shutdown of the write side of the command connection.
    pub async fn shutdown_command(&self) {
        let mut cmd = self.cmd.lock().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), cmd.shutdown()).await;
    }
}

fn drain(rx: &mut mpsc::Receiver<BoxedStream>) {
    rx.close();
    while rx.try_recv().is_ok() {}
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;

    fn target(capacity: usize) -> (Target, DuplexStream) {
        let (cmd, peer) = tokio::io::duplex(64);
        (Target::with_capacity(42, 9000, Box::new(cmd), capacity), peer)
    }

    #[tokio::test]
    async fn queue_accepts_capacity_then_rejects_and_closes() {
        let (t, _peer) = target(4);
        let mut kept = Vec::new();
        for _ in 0..4 {
            let (conn, far) = tokio::io::duplex(8);
            t.register_data_conn(Box::new(conn)).unwrap();
            kept.push(far);
        }

        let (conn, mut far) = tokio::io::duplex(8);
        let err = t.register_data_conn(Box::new(conn)).unwrap_err();
        assert!(matches!(err, TunnelError::QueueFull));

        let mut buf = [0u8; 1];
        assert_eq!(far.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn request_times_out_and_releases_the_queue() {
        let (t, mut peer) = target(4);
        let (_tx, mut cancel) = watch::channel(false);

        let started = Instant::now();
        let err = t
            .request_connection(Duration::from_millis(200), &mut cancel)
            .await
            .err()
            .expect("request should time out");
        let elapsed = started.elapsed();
        assert!(matches!(err, TunnelError::RequestTimeout));
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

        let mut sig = [0u8; 1];
        peer.read_exact(&mut sig).await.unwrap();
        assert_eq!(sig[0], 2);

        // The timed-out waiter must not still hold the receiver.
        let (conn, _far) = tokio::io::duplex(8);
        t.register_data_conn(Box::new(conn)).unwrap();
        let got = tokio::time::timeout(
            Duration::from_secs(1),
            t.request_connection(Duration::from_secs(1), &mut cancel),
        )
        .await
        .unwrap();
        assert!(got.is_ok());
    }

    #[tokio::test]
    async fn request_is_fulfilled_by_a_later_data_conn() {
        let (t, mut peer) = target(4);
        let t = Arc::new(t);

        let t2 = t.clone();
        let client = tokio::spawn(async move {
            let mut sig = [0u8; 1];
            peer.read_exact(&mut sig).await.unwrap();
            let (conn, far) = tokio::io::duplex(8);
            t2.register_data_conn(Box::new(conn)).unwrap();
            (peer, far)
        });

        let (_tx, mut cancel) = watch::channel(false);
        let mut conn = t
            .request_connection(Duration::from_secs(2), &mut cancel)
            .await
            .unwrap();
        let (_peer, mut far) = client.await.unwrap();

        far.write_all(b"x").await.unwrap();
        let mut b = [0u8; 1];
        conn.read_exact(&mut b).await.unwrap();
        assert_eq!(&b, b"x");
    }

    #[tokio::test]
    async fn concurrent_requests_each_get_a_connection() {
        let (t, _peer) = target(8);
        let t = Arc::new(t);

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let t = t.clone();
            waiters.push(tokio::spawn(async move {
                let (_tx, mut cancel) = watch::channel(false);
                t.request_connection(Duration::from_secs(2), &mut cancel)
                    .await
                    .map(|_| ())
            }));
        }

        let mut fars = Vec::new();
        for _ in 0..3 {
            let (conn, far) = tokio::io::duplex(8);
            t.register_data_conn(Box::new(conn)).unwrap();
            fars.push(far);
        }

        for w in waiters {
            w.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_waiter() {
        let (t, _peer) = target(4);
        let (tx, mut cancel) = watch::channel(false);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        });

        let err = t
            .request_connection(Duration::from_secs(5), &mut cancel)
            .await
            .err()
            .expect("request should be cancelled");
        assert!(matches!(err, TunnelError::Cancelled));
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn broken_command_connection_closes_the_target() {
        let (t, peer) = target(4);
        drop(peer);

        let (_tx, mut cancel) = watch::channel(false);
        let err = t
            .request_connection(Duration::from_secs(1), &mut cancel)
            .await
            .err()
            .expect("signal write should fail");
        assert!(matches!(err, TunnelError::Transport(_)), "{err:?}");
        assert!(t.is_closed());

        let (conn, _far) = tokio::io::duplex(8);
        assert!(matches!(
            t.register_data_conn(Box::new(conn)),
            Err(TunnelError::TargetClosed)
        ));
        tokio::time::timeout(Duration::from_millis(100), t.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_while_a_requester_holds_the_queue_drops_queued_conns() {
        let (t, mut peer) = target(4);
        let t = Arc::new(t);

        // Stand-in for a requester parked on the receiver.
        let held = t.queue_rx.lock().await;
        let (conn, mut far) = tokio::io::duplex(8);
        t.register_data_conn(Box::new(conn)).unwrap();

        let t2 = t.clone();
        let waiter = tokio::spawn(async move {
            let (_tx, mut cancel) = watch::channel(false);
            t2.request_connection(Duration::from_secs(5), &mut cancel)
                .await
                .map(|_| ())
        });
        let mut sig = [0u8; 1];
        peer.read_exact(&mut sig).await.unwrap();

        t.close();
        drop(held);

        let res = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TunnelError::TargetClosed)));

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), far.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};
use tracing::Instrument;

use crate::tunnel::{
    shutdown::{self, ShutdownRx},
    stream::BoxedStream,
};

pub const BUFFER_SIZE: usize = 4096;

/// Stops a running (or not yet started) [`Duplex`]. Idempotent.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// One forwarding session between two byte streams.
///
/// Both streams are owned for the lifetime of the session; a `Duplex` cannot
/// exist without them and cannot be restarted once `run` returns.
pub struct Duplex {
    a: BoxedStream,
    b: BoxedStream,
    stop: Arc<watch::Sender<bool>>,
}

impl Duplex {
    pub fn new(a: BoxedStream, b: BoxedStream) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            a,
            b,
            stop: Arc::new(tx),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop.clone(),
        }
    }

    /// Relay bytes both ways until either direction ends, the tunnel is stopped,
    /// or `shutdown` fires. Both streams are closed before returning.
    ///
    /// Returns the error of the direction that ended first. EOF, `stop()` and
    /// shutdown are clean exits; a peer closing its side is not an error.
    pub async fn run(self, mut shutdown: ShutdownRx) -> std::io::Result<()> {
        let Duplex { a, b, stop } = self;
        let mut stopped = stop.subscribe();

        let (mut ra, mut wa) = tokio::io::split(a);
        let (mut rb, mut wb) = tokio::io::split(b);

        let res = tokio::select! {
            r = forward(&mut ra, &mut wb) => r,
            r = forward(&mut rb, &mut wa) => r,
            _ = shutdown::wait(&mut stopped) => Ok(()),
            _ = shutdown::wait(&mut shutdown) => Ok(()),
        };

        close(&mut wa).await;
        close(&mut wb).await;
        stop.send_replace(true);
        res
    }
}

async fn forward<R, W>(rd: &mut R, wr: &mut W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = rd.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        wr.write_all(&buf[..n]).await?;
        wr.flush().await?;
    }
}

async fn close<W: AsyncWrite + Unpin>(w: &mut W) {
    let _ = tokio::time::timeout(Duration::from_secs(1), w.shutdown()).await;
}

/// Live tunnels owned by a backend or client, so they can all be stopped when
/// the owner goes away. Finished tunnels remove themselves.
#[derive(Debug, Default)]
pub struct TunnelSet {
    seq: AtomicU64,
    live: Mutex<HashMap<u64, StopHandle>>,
}

impl TunnelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(
        self: &Arc<Self>,
        duplex: Duplex,
        shutdown: ShutdownRx,
        span: tracing::Span,
    ) -> tokio::task::JoinHandle<()> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, duplex.stop_handle());
        }

        let set = self.clone();
        tokio::spawn(
            async move {
                tracing::debug!("tunnel: started");
                match duplex.run(shutdown).await {
                    Ok(()) => tracing::debug!("tunnel: closed"),
                    Err(err) => tracing::debug!(err = %err, "tunnel: closed with error"),
                }
                if let Ok(mut live) = set.live.lock() {
                    live.remove(&id);
                }
            }
            .instrument(span),
        )
    }

    pub fn len(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop_all(&self) {
        let handles: Vec<StopHandle> = match self.live.lock() {
            Ok(mut live) => live.drain().map(|(_, h)| h).collect(),
            Err(_) => return,
        };
        for h in handles {
            h.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::DuplexStream;

    fn pipes() -> (DuplexStream, DuplexStream, Duplex) {
        let (a_outer, a_inner) = tokio::io::duplex(1024);
        let (b_inner, b_outer) = tokio::io::duplex(1024);
        let d = Duplex::new(Box::new(a_inner), Box::new(b_inner));
        (a_outer, b_outer, d)
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (mut a, mut b, d) = pipes();
        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn(d.run(rx));

        a.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        b.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        b.write_all(b"world").await.unwrap();
        a.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"world");

        run.abort();
    }

    #[tokio::test]
    async fn closing_one_side_ends_run_and_closes_the_other() {
        let (a, mut b, d) = pipes();
        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn(d.run(rx));

        drop(a);

        let res = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run should finish")
            .unwrap();
        assert!(res.is_ok());

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_both_sides() {
        let (mut a, mut b, d) = pipes();
        let h = d.stop_handle();
        let (_tx, rx) = watch::channel(false);
        let run = tokio::spawn(d.run(rx));

        h.stop();
        h.stop();

        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(h.is_stopped());

        let mut buf = [0u8; 1];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_signal_ends_run() {
        let (_a, _b, d) = pipes();
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn(d.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn tunnel_set_tracks_and_stops_live_tunnels() {
        let set = Arc::new(TunnelSet::new());
        let (_tx, rx) = watch::channel(false);

        let (_a1, _b1, d1) = pipes();
        let (_a2, _b2, d2) = pipes();
        let t1 = set.spawn(d1, rx.clone(), tracing::Span::none());
        let t2 = set.spawn(d2, rx.clone(), tracing::Span::none());
        assert_eq!(set.len(), 2);

        set.stop_all();
        tokio::time::timeout(Duration::from_secs(1), async {
            t1.await.unwrap();
            t2.await.unwrap();
        })
        .await
        .unwrap();
        assert!(set.is_empty());
    }
}

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use subtle::ConstantTimeEq;
use tokio::{net::TcpListener, sync::watch};

use crate::net;
use crate::tunnel::{
    duplex::{Duplex, TunnelSet},
    error::TunnelError,
    shutdown::{self, ShutdownRx},
    stream::{self, BoxedStream},
    supervisor,
    target::Target,
};

#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Host the public listener binds on.
    pub public_host: String,
    /// How long to wait on each target for a data connection.
    pub request_timeout: Duration,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            public_host: "0.0.0.0".into(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Public side of one exposed port.
///
/// Every member target was registered with the secret of the first one; the
/// secret never changes. Inbound connections are handed to whichever member
/// first supplies a data connection.
pub struct Backend {
    port: u16,
    secret: Vec<u8>,
    opts: BackendOptions,
    members: Mutex<BTreeMap<u64, Arc<Target>>>,
    cursor: AtomicUsize,
    local_addr: SocketAddr,
    pending: Mutex<Option<TcpListener>>,
    stop: watch::Sender<bool>,
    tunnels: Arc<TunnelSet>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("port", &self.port)
            .field("local_addr", &self.local_addr)
            .field("members", &self.len())
            .finish_non_exhaustive()
    }
}

impl Backend {
    /// Bind the public listener for `port`. The listener starts accepting once
    /// [`Backend::listen`] runs.
    pub async fn bind(
        port: u16,
        secret: Vec<u8>,
        opts: BackendOptions,
    ) -> std::io::Result<Arc<Self>> {
        let ln = TcpListener::bind(net::host_port(&opts.public_host, port)).await?;
        let local_addr = ln.local_addr()?;
        let (stop, _rx) = watch::channel(false);

        Ok(Arc::new(Self {
            port,
            secret,
            opts,
            members: Mutex::new(BTreeMap::new()),
            cursor: AtomicUsize::new(0),
            local_addr,
            pending: Mutex::new(Some(ln)),
            stop,
            tunnels: Arc::new(TunnelSet::new()),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn validate_secret(&self, secret: &[u8]) -> bool {
        self.secret.as_slice().ct_eq(secret).into()
    }

    pub fn secret_len(&self) -> usize {
        self.secret.len()
    }

    pub fn add_target(&self, target: Arc<Target>) {
        if let Ok(mut m) = self.members.lock() {
            m.insert(target.id(), target);
        }
    }

    pub fn remove_target(&self, id: u64) -> Option<Arc<Target>> {
        self.members.lock().ok().and_then(|mut m| m.remove(&id))
    }

    pub fn has_member(&self, id: u64) -> bool {
        self.members
            .lock()
            .map(|m| m.contains_key(&id))
            .unwrap_or(false)
    }

    pub fn member_ids(&self) -> Vec<u64> {
        self.members
            .lock()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.members.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Members in dispatch order. The start rotates on every call.
    fn candidates(&self) -> Vec<Arc<Target>> {
        let mut v: Vec<Arc<Target>> = match self.members.lock() {
            Ok(m) => m.values().cloned().collect(),
            Err(_) => return Vec::new(),
        };
        if !v.is_empty() {
            let k = self.cursor.fetch_add(1, Ordering::Relaxed) % v.len();
            v.rotate_left(k);
        }
        v
    }

    /// Pair an inbound public connection with a data connection from one of
    /// the members and start a tunnel between them.
    ///
    /// Members are tried one after another. When none supplies a connection,
    /// `public` is closed.
    pub async fn dispatch(
        &self,
        public: BoxedStream,
        shutdown: ShutdownRx,
    ) -> Result<(), TunnelError> {
        let mut cancel = shutdown.clone();
        for target in self.candidates() {
            match target
                .request_connection(self.opts.request_timeout, &mut cancel)
                .await
            {
                Ok(data) => {
                    let span = tracing::debug_span!("tunnel", port = self.port, target_id = target.id());
                    self.tunnels
                        .spawn(Duplex::new(public, data), shutdown, span);
                    return Ok(());
                }
                Err(TunnelError::Cancelled) => return Err(TunnelError::Cancelled),
                Err(err) => {
                    tracing::debug!(
                        port = self.port,
                        target_id = target.id(),
                        err = %err,
                        "tunnel: target did not supply a data connection"
                    );
                }
            }
        }
        drop(public);
        Err(TunnelError::NoAvailableTarget)
    }

    /// Accept public connections until `shutdown` fires or [`Backend::stop`]
    /// is called. Listener failures rebind with backoff. All live tunnels are
    /// stopped on return.
    pub async fn listen(self: Arc<Self>, shutdown: ShutdownRx) {
        let name = format!("backend:{}", self.port);
        let mut stop = self.stop.subscribe();

        let me = self.clone();
        let sd = shutdown.clone();
        let run = supervisor::supervise(&name, shutdown, move || {
            let me = me.clone();
            let sd = sd.clone();
            async move {
                let ln = me.take_or_bind().await?;
                me.accept_loop(ln, sd).await
            }
        });

        tokio::select! {
            _ = run => {}
            _ = shutdown::wait(&mut stop) => {}
        }

        self.stop.send_replace(true);
        self.tunnels.stop_all();
        tracing::info!(port = self.port, "tunnel: backend stopped");
    }

    async fn take_or_bind(&self) -> anyhow::Result<TcpListener> {
        let pending = self.pending.lock().ok().and_then(|mut p| p.take());
        if let Some(ln) = pending {
            return Ok(ln);
        }
        TcpListener::bind(self.local_addr)
            .await
            .with_context(|| format!("tunnel: backend rebind {}", self.local_addr))
    }

    async fn accept_loop(
        self: &Arc<Self>,
        ln: TcpListener,
        shutdown: ShutdownRx,
    ) -> anyhow::Result<()> {
        tracing::info!(port = self.port, addr = %self.local_addr, "tunnel: backend listening");

        let mut stop = self.stop.subscribe();
        let mut sd = shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown::wait(&mut stop) => return Ok(()),
                _ = shutdown::wait(&mut sd) => return Ok(()),
                res = ln.accept() => {
                    let (c, peer) = res.context("tunnel: backend accept")?;
                    let me = self.clone();
                    let sd = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = me.dispatch(stream::boxed_tcp(c), sd).await {
                            tracing::warn!(port = me.port, peer = %peer, err = %err, "tunnel: public connection dropped");
                        }
                    });
                }
            }
        }
    }
}

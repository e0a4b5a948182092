use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use subtle::ConstantTimeEq;
use tokio::{io::AsyncReadExt, net::TcpListener, sync::watch};

use crate::tunnel::{
    backend::{Backend, BackendOptions},
    error::TunnelError,
    protocol::{self, Hello, HelloType, ProtocolError},
    registry::{Registration, Registry, RegistryOptions},
    shutdown::{self, ShutdownRx},
    stream::{self, BoxedStream},
    supervisor,
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// Bind host for per-port public listeners.
    pub public_host: String,
    /// Server-wide secret every hello must carry. `None` skips the check and
    /// leaves each port guarded only by its backend's secret.
    pub secret: Option<Vec<u8>>,
    /// Deadline for reading a hello from a new connection.
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
}

pub struct Server {
    opts: ServerOptions,
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    pending: Mutex<Option<TcpListener>>,
    stop: watch::Sender<bool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind the control listener. Failure here is a startup error.
    pub async fn bind(opts: ServerOptions) -> anyhow::Result<Arc<Self>> {
        if let Some(secret) = &opts.secret {
            protocol::validate_secret_len(secret.len()).context("tunnel: server secret")?;
        }

        let ln = TcpListener::bind(&opts.listen_addr)
            .await
            .with_context(|| format!("tunnel: bind {}", opts.listen_addr))?;
        let local_addr = ln.local_addr()?;

        let registry = Arc::new(Registry::new(RegistryOptions {
            backend: BackendOptions {
                public_host: opts.public_host.clone(),
                request_timeout: opts.request_timeout,
            },
            queue_capacity: opts.queue_capacity,
        }));
        let (stop, _rx) = watch::channel(false);

        Ok(Arc::new(Self {
            opts,
            registry,
            local_addr,
            pending: Mutex::new(Some(ln)),
            stop,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Stop accepting and tear down every backend. Idempotent.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Serve the control port until `shutdown` fires or [`Server::stop`] is
    /// called. Accept failures rebind with backoff.
    pub async fn listen_and_serve(self: Arc<Self>, shutdown: ShutdownRx) -> anyhow::Result<()> {
        tracing::info!(addr = %self.local_addr, "tunnel: listening");

        let me = self.clone();
        let mut ext = shutdown;
        let relay = tokio::spawn(async move {
            shutdown::wait(&mut ext).await;
            me.stop();
        });

        let me = self.clone();
        supervisor::supervise("control", self.stop.subscribe(), move || {
            let me = me.clone();
            async move {
                let ln = me.take_or_bind().await?;
                me.accept_loop(ln).await
            }
        })
        .await;

        relay.abort();
        self.stop();
        for b in self.registry.backends().await {
            b.stop();
        }
        tracing::info!(addr = %self.local_addr, "tunnel: stopped");
        Ok(())
    }

    async fn take_or_bind(&self) -> anyhow::Result<TcpListener> {
        let pending = self.pending.lock().ok().and_then(|mut p| p.take());
        if let Some(ln) = pending {
            return Ok(ln);
        }
        TcpListener::bind(self.local_addr)
            .await
            .with_context(|| format!("tunnel: rebind {}", self.local_addr))
    }

    async fn accept_loop(self: &Arc<Self>, ln: TcpListener) -> anyhow::Result<()> {
        let mut stop = self.stop.subscribe();
        loop {
            tokio::select! {
                _ = shutdown::wait(&mut stop) => return Ok(()),
                res = ln.accept() => {
                    let (c, peer) = res.context("tunnel: accept")?;
                    let me = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = me.handle_conn(stream::boxed_tcp(c), peer).await {
                            tracing::warn!(peer = %peer, err = %err, "tunnel: connection rejected");
                        }
                    });
                }
            }
        }
    }

    async fn handle_conn(
        self: Arc<Self>,
        mut conn: BoxedStream,
        peer: SocketAddr,
    ) -> Result<(), TunnelError> {
        let hello = tokio::time::timeout(self.opts.connect_timeout, self.read_hello(&mut conn))
            .await
            .map_err(|_| TunnelError::timed_out("handshake"))??;

        if let Some(secret) = &self.opts.secret {
            if !bool::from(secret.as_slice().ct_eq(&hello.secret)) {
                return Err(TunnelError::AuthFailure);
            }
        }

        match hello.kind {
            HelloType::Command => self.handle_command(conn, hello, peer).await,
            HelloType::Data => {
                let id = self.registry.register_data(&hello, conn).await?;
                tracing::debug!(peer = %peer, port = hello.port, target_id = id, "tunnel: data connection queued");
                Ok(())
            }
            HelloType::ServerHello => Err(TunnelError::MalformedHello(ProtocolError::UnknownType(
                HelloType::ServerHello.as_byte(),
            ))),
        }
    }

    /// Read a hello without consuming anything past its secret. The secret
    /// length comes from the server secret, else from the backend already
    /// serving the port. Only a command for an unserved port falls back to
    /// taking what the transport delivered.
    async fn read_hello(&self, conn: &mut BoxedStream) -> Result<Hello, TunnelError> {
        let header = protocol::read_header(conn).await?;
        let secret_len = match &self.opts.secret {
            Some(s) => Some(s.len()),
            None => self
                .registry
                .backend(header.port)
                .await
                .map(|b| b.secret_len()),
        };
        let secret = protocol::read_secret(conn, secret_len).await?;
        Ok(header.with_secret(secret)?)
    }

    async fn handle_command(
        self: Arc<Self>,
        conn: BoxedStream,
        hello: Hello,
        peer: SocketAddr,
    ) -> Result<(), TunnelError> {
        let (mut rd, wr) = tokio::io::split(conn);
        let Registration {
            target,
            backend,
            created,
        } = self
            .registry
            .register_command(hello.port, &hello.secret, Box::new(wr))
            .await?;

        if created {
            self.spawn_backend(backend);
        }
        tracing::info!(peer = %peer, port = hello.port, target_id = target.id(), "tunnel: target registered");

        // Clients never send on the command connection after the hello; reads
        // only detect that it went away.
        let mut stop = self.stop.subscribe();
        let mut buf = [0u8; 64];
        let reason = loop {
            tokio::select! {
                r = rd.read(&mut buf) => match r {
                    Ok(0) => break "eof".to_string(),
                    Ok(_) => continue,
                    Err(err) => break err.to_string(),
                },
                _ = target.closed() => break "target closed".to_string(),
                _ = shutdown::wait(&mut stop) => break "shutdown".to_string(),
            }
        };

        self.registry.unregister_target(&target).await;
        target.close();
        target.shutdown_command().await;
        tracing::info!(
            peer = %peer,
            port = hello.port,
            target_id = target.id(),
            reason = %reason,
            uptime = %humantime::format_duration(Duration::from_secs(target.uptime().as_secs())),
            "tunnel: target removed"
        );
        Ok(())
    }

    fn spawn_backend(self: &Arc<Self>, backend: Arc<Backend>) {
        let me = self.clone();
        tokio::spawn(async move {
            backend.clone().listen(me.stop.subscribe()).await;
            if me.registry.remove_backend_if_same(&backend).await {
                tracing::info!(port = backend.port(), "tunnel: backend removed");
            }
        });
    }
}

use std::{sync::Arc, time::Duration};

use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::{Semaphore, watch},
};

use crate::net;
use crate::tunnel::{
    duplex::{Duplex, TunnelSet},
    error::TunnelError,
    protocol::{self, Hello, HelloType},
    shutdown::{self, ShutdownRx},
    stream::{self, BoxedStream},
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    /// Port the server should expose on our behalf.
    pub remote_port: u16,
    /// Local service that public traffic is forwarded to.
    pub forward_addr: String,
    pub secret: Vec<u8>,
    pub dial_timeout: Duration,
    /// Upper bound on concurrently running data tunnels.
    pub max_connections: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    HandshakeSent,
    AwaitingId,
    Active(u64),
    Terminated,
}

pub struct Client {
    opts: ClientOptions,
    state: watch::Sender<ClientState>,
    permits: Arc<Semaphore>,
    tunnels: Arc<TunnelSet>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_addr", &self.opts.server_addr)
            .field("remote_port", &self.opts.remote_port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> Result<Self, TunnelError> {
        protocol::validate_secret_len(opts.secret.len())?;
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        let max = opts.max_connections.max(1);
        let (state, _rx) = watch::channel(ClientState::Connecting);

        Ok(Self {
            opts,
            state,
            permits: Arc::new(Semaphore::new(max)),
            tunnels: Arc::new(TunnelSet::new()),
        })
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn live_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    /// Register with the server and serve data requests until the command
    /// connection fails (an error) or `shutdown` fires (a clean return).
    ///
    /// There is no reconnect; callers decide whether to run again.
    pub async fn run(&self, mut shutdown: ShutdownRx) -> Result<(), TunnelError> {
        let res = self.run_inner(&mut shutdown).await;
        self.tunnels.stop_all();
        self.state.send_replace(ClientState::Terminated);
        match &res {
            Ok(()) => tracing::info!(server = %self.opts.server_addr, "tunnel: client stopped"),
            Err(err) => tracing::warn!(server = %self.opts.server_addr, err = %err, "tunnel: client terminated"),
        }
        res
    }

    async fn run_inner(&self, shutdown: &mut ShutdownRx) -> Result<(), TunnelError> {
        self.state.send_replace(ClientState::Connecting);
        let conn = tokio::select! {
            c = dial(&self.opts.server_addr, self.opts.dial_timeout) => c?,
            _ = shutdown::wait(shutdown) => return Ok(()),
        };

        let (mut rd, mut wr) = tokio::io::split(conn);
        protocol::write_hello(
            &mut wr,
            &Hello::command(self.opts.remote_port, &self.opts.secret),
        )
        .await?;
        self.state.send_replace(ClientState::HandshakeSent);
        tracing::info!(
            server = %self.opts.server_addr,
            remote_port = self.opts.remote_port,
            "tunnel: connected"
        );

        let hello_len = Hello::encoded_len(self.opts.secret.len());
        let mut pending: Vec<u8> = Vec::with_capacity(hello_len * 2);
        let mut buf = [0u8; 512];
        self.state.send_replace(ClientState::AwaitingId);

        loop {
            let n = tokio::select! {
                r = rd.read(&mut buf) => r?,
                _ = shutdown::wait(shutdown) => return Ok(()),
            };
            if n == 0 {
                return Err(TunnelError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "command connection closed by server",
                )));
            }
            pending.extend_from_slice(&buf[..n]);
            self.consume(&mut pending, hello_len, shutdown)?;
        }
    }

    /// Handle every complete message buffered on the command connection.
    fn consume(
        &self,
        pending: &mut Vec<u8>,
        hello_len: usize,
        shutdown: &ShutdownRx,
    ) -> Result<(), TunnelError> {
        let mut i = 0;
        while i < pending.len() {
            match HelloType::from_byte(pending[i]) {
                Some(HelloType::Data) => {
                    match self.state() {
                        ClientState::Active(id) => self.open_data(id, shutdown.clone()),
                        _ => tracing::warn!("tunnel: data request before registration; ignored"),
                    }
                    i += 1;
                }
                Some(HelloType::ServerHello) => {
                    if pending.len() - i < hello_len {
                        break;
                    }
                    let hello = Hello::decode(&pending[i..i + hello_len])?;
                    i += hello_len;
                    if hello.port != self.opts.remote_port {
                        tracing::warn!(
                            want = self.opts.remote_port,
                            got = hello.port,
                            "tunnel: server hello for another port"
                        );
                    }
                    self.state.send_replace(ClientState::Active(hello.id));
                    tracing::info!(
                        id = hello.id,
                        remote_port = hello.port,
                        "tunnel: registered"
                    );
                }
                _ => {
                    tracing::warn!(byte = pending[i], "tunnel: unexpected byte on command connection");
                    i += 1;
                }
            }
        }
        pending.drain(..i);
        Ok(())
    }

    fn open_data(&self, id: u64, shutdown: ShutdownRx) {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::warn!(
                max = self.opts.max_connections,
                "tunnel: connection limit reached; data request dropped"
            );
            return;
        };

        let opts = self.opts.clone();
        let tunnels = self.tunnels.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let duplex = match open_data_tunnel(&opts, id).await {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(forward = %opts.forward_addr, err = %err, "tunnel: data connection failed");
                    return;
                }
            };
            let span = tracing::debug_span!("tunnel", id, forward = %opts.forward_addr);
            let _ = tunnels.spawn(duplex, shutdown, span).await;
        });
    }
}

/// Dial the server with a `Data` hello, then the local service. A failed local
/// dial drops (closes) the data connection.
async fn open_data_tunnel(opts: &ClientOptions, id: u64) -> Result<Duplex, TunnelError> {
    let mut data = dial(&opts.server_addr, opts.dial_timeout).await?;
    protocol::write_hello(
        &mut data,
        &Hello::data(id, opts.remote_port, &opts.secret),
    )
    .await?;

    let local = dial(&opts.forward_addr, opts.dial_timeout).await?;
    Ok(Duplex::new(data, local))
}

async fn dial(addr: &str, timeout: Duration) -> Result<BoxedStream, TunnelError> {
    let addr = net::normalize_dial_addr(addr);
    let c = tokio::time::timeout(timeout, TcpStream::connect(addr.as_ref()))
        .await
        .map_err(|_| TunnelError::timed_out(format!("dial {addr}")))??;
    Ok(stream::boxed_tcp(c))
}

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinSet};

use crate::config::{ClientConfig, ServerConfig};
use crate::logging;
use crate::tunnel::{client::Client, server::Server};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_server(cfg: ServerConfig) -> anyhow::Result<()> {
    let _logrt = logging::init(&cfg.logging)?;

    let server = Server::bind(cfg.options()).await?;
    tracing::info!(
        listen = %server.local_addr(),
        public_host = %cfg.public_host,
        request_timeout = %humantime::format_duration(cfg.request_timeout),
        "startup: server"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(server.listen_and_serve(shutdown_rx));

    serve_until(tasks, shutdown_tx, shutdown_signal()).await
}

pub async fn run_client(cfg: ClientConfig) -> anyhow::Result<()> {
    let _logrt = logging::init(&cfg.logging)?;

    let opts = cfg.options();
    tracing::info!(
        server = %opts.server_addr,
        remote_port = opts.remote_port,
        forward = %opts.forward_addr,
        max_connections = opts.max_connections,
        "startup: client"
    );
    let client = Arc::new(Client::new(opts)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    tasks.spawn(async move { client.run(shutdown_rx).await.map_err(anyhow::Error::from) });

    serve_until(tasks, shutdown_tx, shutdown_signal()).await
}

/// Run `tasks` until `signal` resolves or one of them finishes. A task error
/// is returned after the rest are told to shut down.
async fn serve_until(
    mut tasks: JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    signal: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut result = Ok(());

    tokio::select! {
        _ = signal => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => {}
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("shutdown: tasks did not finish in time; aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

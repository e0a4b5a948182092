use std::path::PathBuf;

use clap::Parser;
use tcptunnel::{
    app,
    config::{self, FileClientConfig, FileLogging},
};

#[derive(Debug, Parser)]
#[command(
    name = "run-client",
    version,
    about = "Reverse TCP tunnel client: publishes a local port through a tunnel server"
)]
struct Cli {
    /// Config file (.toml/.yaml/.yml). Repeatable; later files override earlier ones.
    #[arg(short = 'f', long = "file", env = "TCPTUNNEL_CLIENT_CONFIG", value_delimiter = ',')]
    files: Vec<PathBuf>,

    /// Tunnel server control address, e.g. `tunnel.example.com:7890`.
    #[arg(long, env = "TCPTUNNEL_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// Port to expose on the server.
    #[arg(long, env = "TCPTUNNEL_REMOTE_PORT")]
    remote_port: Option<u16>,

    #[arg(long, env = "TCPTUNNEL_FORWARD_HOST")]
    forward_host: Option<String>,

    /// Local port public traffic is forwarded to.
    #[arg(long, env = "TCPTUNNEL_FORWARD_PORT")]
    forward_port: Option<u16>,

    #[arg(long, env = "TCPTUNNEL_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[arg(long, env = "TCPTUNNEL_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<i64>,

    #[arg(long, env = "TCPTUNNEL_MAX_CONNECTIONS")]
    max_connections: Option<i64>,

    /// debug|info|warn|error
    #[arg(long, env = "TCPTUNNEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// text|json
    #[arg(long, env = "TCPTUNNEL_LOG_FORMAT")]
    log_format: Option<String>,
}

impl Cli {
    fn overrides(&self) -> FileClientConfig {
        let logging = (self.log_level.is_some() || self.log_format.is_some()).then(|| FileLogging {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
            ..Default::default()
        });
        FileClientConfig {
            server_address: self.server_address.clone(),
            remote_port: self.remote_port,
            forward_host: self.forward_host.clone(),
            forward_port: self.forward_port,
            secret: self.secret.clone(),
            connect_timeout_ms: self.connect_timeout_ms,
            max_connections: self.max_connections,
            logging,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_client(&cli.files, cli.overrides())?;
    app::run_client(cfg).await
}

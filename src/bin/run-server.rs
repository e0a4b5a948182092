use std::path::PathBuf;

use clap::Parser;
use tcptunnel::{
    app,
    config::{self, FileLogging, FileServerConfig},
};

#[derive(Debug, Parser)]
#[command(
    name = "run-server",
    version,
    about = "Reverse TCP tunnel server: exposes ports on behalf of connected clients"
)]
struct Cli {
    /// Config file (.toml/.yaml/.yml). Repeatable; later files override earlier ones.
    #[arg(short = 'f', long = "file", env = "TCPTUNNEL_SERVER_CONFIG", value_delimiter = ',')]
    files: Vec<PathBuf>,

    /// Control port clients connect to.
    #[arg(long, env = "TCPTUNNEL_LISTEN_PORT")]
    listen_port: Option<u16>,

    #[arg(long, env = "TCPTUNNEL_LISTEN_HOST")]
    listen_host: Option<String>,

    /// Host the exposed ports bind on.
    #[arg(long, env = "TCPTUNNEL_PUBLIC_HOST")]
    public_host: Option<String>,

    /// Shared secret (16-32 bytes) every client must present.
    #[arg(long, env = "TCPTUNNEL_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[arg(long, env = "TCPTUNNEL_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<i64>,

    #[arg(long, env = "TCPTUNNEL_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<i64>,

    #[arg(long, env = "TCPTUNNEL_QUEUE_CAPACITY")]
    queue_capacity: Option<i64>,

    /// debug|info|warn|error
    #[arg(long, env = "TCPTUNNEL_LOG_LEVEL")]
    log_level: Option<String>,

    /// text|json
    #[arg(long, env = "TCPTUNNEL_LOG_FORMAT")]
    log_format: Option<String>,
}

impl Cli {
    fn overrides(&self) -> FileServerConfig {
        let logging = (self.log_level.is_some() || self.log_format.is_some()).then(|| FileLogging {
            level: self.log_level.clone(),
            format: self.log_format.clone(),
            ..Default::default()
        });
        FileServerConfig {
            listen_port: self.listen_port,
            listen_host: self.listen_host.clone(),
            public_host: self.public_host.clone(),
            secret: self.secret.clone(),
            connect_timeout_ms: self.connect_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            queue_capacity: self.queue_capacity,
            logging,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_server(&cli.files, cli.overrides())?;
    app::run_server(cfg).await
}

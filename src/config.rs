use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};

use crate::net;
use crate::tunnel::{client::ClientOptions, protocol, server::ServerOptions};

pub const DEFAULT_LISTEN_PORT: u16 = 7890;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_port: u16,
    pub listen_host: String,
    pub public_host: String,
    pub secret: Vec<u8>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    pub logging: LoggingConfig,
}

impl ServerConfig {
    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            listen_addr: net::host_port(&self.listen_host, self.listen_port),
            public_host: self.public_host.clone(),
            secret: Some(self.secret.clone()),
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            queue_capacity: self.queue_capacity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_address: String,
    pub remote_port: u16,
    pub forward_host: String,
    pub forward_port: u16,
    pub secret: Vec<u8>,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub logging: LoggingConfig,
}

impl ClientConfig {
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            server_addr: self.server_address.clone(),
            remote_port: self.remote_port,
            forward_addr: net::host_port(&self.forward_host, self.forward_port),
            secret: self.secret.clone(),
            dial_timeout: self.connect_timeout,
            max_connections: self.max_connections,
        }
    }
}

// --- On-disk shapes. Every field is optional so files can be layered. ---

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileLogging {
    pub level: Option<String>,
    pub format: Option<String>,
    pub output: Option<String>,
    pub add_source: Option<bool>,
}

impl FileLogging {
    fn merge(&mut self, later: FileLogging) {
        merge(&mut self.level, later.level);
        merge(&mut self.format, later.format);
        merge(&mut self.output, later.output);
        merge(&mut self.add_source, later.add_source);
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileServerConfig {
    pub listen_port: Option<u16>,
    pub listen_host: Option<String>,
    pub public_host: Option<String>,
    pub secret: Option<String>,
    pub connect_timeout_ms: Option<i64>,
    pub request_timeout_ms: Option<i64>,
    pub queue_capacity: Option<i64>,
    pub logging: Option<FileLogging>,
}

impl FileServerConfig {
    /// Overlay `later` on top of `self`, field by field.
    pub fn merge(&mut self, later: FileServerConfig) {
        merge(&mut self.listen_port, later.listen_port);
        merge(&mut self.listen_host, later.listen_host);
        merge(&mut self.public_host, later.public_host);
        merge(&mut self.secret, later.secret);
        merge(&mut self.connect_timeout_ms, later.connect_timeout_ms);
        merge(&mut self.request_timeout_ms, later.request_timeout_ms);
        merge(&mut self.queue_capacity, later.queue_capacity);
        merge_logging(&mut self.logging, later.logging);
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileClientConfig {
    pub server_address: Option<String>,
    pub remote_port: Option<u16>,
    pub forward_host: Option<String>,
    pub forward_port: Option<u16>,
    pub secret: Option<String>,
    pub connect_timeout_ms: Option<i64>,
    pub max_connections: Option<i64>,
    pub logging: Option<FileLogging>,
}

impl FileClientConfig {
    pub fn merge(&mut self, later: FileClientConfig) {
        merge(&mut self.server_address, later.server_address);
        merge(&mut self.remote_port, later.remote_port);
        merge(&mut self.forward_host, later.forward_host);
        merge(&mut self.forward_port, later.forward_port);
        merge(&mut self.secret, later.secret);
        merge(&mut self.connect_timeout_ms, later.connect_timeout_ms);
        merge(&mut self.max_connections, later.max_connections);
        merge_logging(&mut self.logging, later.logging);
    }
}

fn merge<T>(dst: &mut Option<T>, later: Option<T>) {
    if later.is_some() {
        *dst = later;
    }
}

fn merge_logging(dst: &mut Option<FileLogging>, later: Option<FileLogging>) {
    match (dst.as_mut(), later) {
        (Some(d), Some(l)) => d.merge(l),
        (None, Some(l)) => *dst = Some(l),
        (_, None) => {}
    }
}

/// Parse one config file; the format follows the extension.
pub fn read_file<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display())),
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))
        }
        _ => anyhow::bail!("config: unsupported config extension {:?}", ext),
    }
}

/// Layer `paths` in order, then `overrides` (flags and environment) on top.
pub fn load_server(paths: &[PathBuf], overrides: FileServerConfig) -> anyhow::Result<ServerConfig> {
    let mut fc = FileServerConfig::default();
    for p in paths {
        fc.merge(read_file(p)?);
    }
    fc.merge(overrides);
    ServerConfig::from_file_config(fc)
}

pub fn load_client(paths: &[PathBuf], overrides: FileClientConfig) -> anyhow::Result<ClientConfig> {
    let mut fc = FileClientConfig::default();
    for p in paths {
        fc.merge(read_file(p)?);
    }
    fc.merge(overrides);
    ClientConfig::from_file_config(fc)
}

impl ServerConfig {
    pub fn from_file_config(fc: FileServerConfig) -> anyhow::Result<Self> {
        let listen_port = fc.listen_port.unwrap_or(DEFAULT_LISTEN_PORT);
        if listen_port == 0 {
            anyhow::bail!("config: listen_port must be non-zero");
        }

        let secret = fc
            .secret
            .filter(|s| !s.trim().is_empty())
            .context("config: secret is required")?;

        Ok(Self {
            listen_port,
            listen_host: non_empty(fc.listen_host).unwrap_or_else(|| "0.0.0.0".into()),
            public_host: non_empty(fc.public_host).unwrap_or_else(|| "0.0.0.0".into()),
            secret: secret_bytes(&secret)?,
            connect_timeout: millis("connect_timeout_ms", fc.connect_timeout_ms, 5000)?,
            request_timeout: millis("request_timeout_ms", fc.request_timeout_ms, 5000)?,
            queue_capacity: positive("queue_capacity", fc.queue_capacity, 1024)?,
            logging: logging_config(fc.logging)?,
        })
    }
}

impl ClientConfig {
    pub fn from_file_config(fc: FileClientConfig) -> anyhow::Result<Self> {
        let server_address =
            non_empty(fc.server_address).context("config: server_address is required")?;
        let remote_port = required_port("remote_port", fc.remote_port)?;
        let forward_port = required_port("forward_port", fc.forward_port)?;
        let secret = fc
            .secret
            .filter(|s| !s.trim().is_empty())
            .context("config: secret is required")?;

        Ok(Self {
            server_address,
            remote_port,
            forward_host: non_empty(fc.forward_host).unwrap_or_else(|| "127.0.0.1".into()),
            forward_port,
            secret: secret_bytes(&secret)?,
            connect_timeout: millis("connect_timeout_ms", fc.connect_timeout_ms, 5000)?,
            max_connections: positive("max_connections", fc.max_connections, 100)?,
            logging: logging_config(fc.logging)?,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secret_bytes(s: &str) -> anyhow::Result<Vec<u8>> {
    protocol::validate_secret_len(s.len()).context("config: invalid secret")?;
    Ok(s.as_bytes().to_vec())
}

fn required_port(name: &str, v: Option<u16>) -> anyhow::Result<u16> {
    match v {
        Some(0) => anyhow::bail!("config: {name} must be non-zero"),
        Some(p) => Ok(p),
        None => anyhow::bail!("config: {name} is required"),
    }
}

fn millis(name: &str, v: Option<i64>, default: u64) -> anyhow::Result<Duration> {
    match v {
        None => Ok(Duration::from_millis(default)),
        Some(ms) if ms > 0 => Ok(Duration::from_millis(ms as u64)),
        Some(ms) => anyhow::bail!("config: {name} must be positive, got {ms}"),
    }
}

fn positive(name: &str, v: Option<i64>, default: usize) -> anyhow::Result<usize> {
    match v {
        None => Ok(default),
        Some(n) if n > 0 => Ok(n as usize),
        Some(n) => anyhow::bail!("config: {name} must be positive, got {n}"),
    }
}

fn logging_config(l: Option<FileLogging>) -> anyhow::Result<LoggingConfig> {
    let mut cfg = LoggingConfig::default();
    let Some(l) = l else {
        return Ok(cfg);
    };

    if let Some(level) = non_empty(l.level) {
        let level = level.to_ascii_lowercase();
        if !matches!(level.as_str(), "debug" | "info" | "warn" | "error") {
            anyhow::bail!("config: logging.level must be debug|info|warn|error, got {level:?}");
        }
        cfg.level = level;
    }
    if let Some(fmt) = non_empty(l.format) {
        let fmt = fmt.to_ascii_lowercase();
        if !matches!(fmt.as_str(), "text" | "json") {
            anyhow::bail!("config: logging.format must be text|json, got {fmt:?}");
        }
        cfg.format = fmt;
    }
    if let Some(out) = non_empty(l.output) {
        cfg.output = out;
    }
    cfg.add_source = l.add_source.unwrap_or(false);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "tcptunnel_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn server_file(secret: &str) -> FileServerConfig {
        FileServerConfig {
            secret: Some(secret.into()),
            ..Default::default()
        }
    }

    #[test]
    fn server_defaults() {
        let cfg = ServerConfig::from_file_config(server_file("0123456789abcdef")).unwrap();
        assert_eq!(cfg.listen_port, 7890);
        assert_eq!(cfg.secret, b"0123456789abcdef".to_vec());
        assert_eq!(cfg.options().secret, Some(b"0123456789abcdef".to_vec()));
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.queue_capacity, 1024);
        assert_eq!(cfg.logging, LoggingConfig::default());
        assert_eq!(cfg.options().listen_addr, "0.0.0.0:7890");
    }

    #[test]
    fn later_files_and_overrides_win_field_by_field() {
        let dir = temp_dir("layering");
        let base = dir.join("base.toml");
        let extra = dir.join("extra.yaml");

        std::fs::write(
            &base,
            r#"
server_address = "tunnel.example.com:7890"
remote_port = 8080
forward_port = 3000
secret = "0123456789abcdef"

[logging]
level = "debug"
format = "json"
"#,
        )
        .unwrap();
        std::fs::write(
            &extra,
            "remote_port: 9090\nmax_connections: 8\nlogging:\n  format: text\n",
        )
        .unwrap();

        let overrides = FileClientConfig {
            forward_host: Some("10.0.0.2".into()),
            ..Default::default()
        };
        let cfg = load_client(&[base, extra], overrides).unwrap();

        assert_eq!(cfg.server_address, "tunnel.example.com:7890");
        assert_eq!(cfg.remote_port, 9090);
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "text");
        assert_eq!(cfg.options().forward_addr, "10.0.0.2:3000");
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = temp_dir("unknown");
        let p = dir.join("server.toml");
        std::fs::write(&p, "listen_port = 7000\nlisten_prot = 1\n").unwrap();
        let err = load_server(&[p], FileServerConfig::default()).unwrap_err();
        assert!(format!("{err:#}").contains("listen_prot"), "{err:#}");
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = temp_dir("ext");
        let p = dir.join("server.json");
        std::fs::write(&p, "{}").unwrap();
        assert!(load_server(&[p], FileServerConfig::default()).is_err());
    }

    #[test]
    fn server_requires_a_secret() {
        let err = ServerConfig::from_file_config(FileServerConfig::default()).unwrap_err();
        assert!(err.to_string().contains("secret"), "{err:#}");
        assert!(ServerConfig::from_file_config(server_file("  ")).is_err());
    }

    #[test]
    fn secret_length_is_enforced() {
        assert!(ServerConfig::from_file_config(server_file("too-short")).is_err());

        let long = FileClientConfig {
            server_address: Some(":7890".into()),
            remote_port: Some(1),
            forward_port: Some(2),
            secret: Some("x".repeat(33)),
            ..Default::default()
        };
        assert!(ClientConfig::from_file_config(long).is_err());
    }

    #[test]
    fn client_requires_ports_and_secret() {
        let full = FileClientConfig {
            server_address: Some(":7890".into()),
            remote_port: Some(8080),
            forward_port: Some(3000),
            secret: Some("0123456789abcdef".into()),
            ..Default::default()
        };
        assert!(ClientConfig::from_file_config(full.clone()).is_ok());

        let mut zero = full.clone();
        zero.remote_port = Some(0);
        let err = ClientConfig::from_file_config(zero).unwrap_err();
        assert!(err.to_string().contains("remote_port"));

        let mut missing = full.clone();
        missing.forward_port = None;
        assert!(ClientConfig::from_file_config(missing).is_err());

        let mut no_secret = full;
        no_secret.secret = Some("   ".into());
        assert!(ClientConfig::from_file_config(no_secret).is_err());
    }

    #[test]
    fn invalid_timeouts_and_logging_are_rejected() {
        let base = server_file("0123456789abcdef");
        assert!(ServerConfig::from_file_config(base.clone()).is_ok());

        let fc = FileServerConfig {
            request_timeout_ms: Some(0),
            ..base.clone()
        };
        let err = ServerConfig::from_file_config(fc).unwrap_err();
        assert!(err.to_string().contains("request_timeout_ms"), "{err:#}");

        let fc = FileServerConfig {
            logging: Some(FileLogging {
                format: Some("xml".into()),
                ..Default::default()
            }),
            ..base
        };
        let err = ServerConfig::from_file_config(fc).unwrap_err();
        assert!(err.to_string().contains("logging.format"), "{err:#}");
    }
}

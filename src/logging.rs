use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Keeps the non-blocking writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(&cfg.level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(cfg.output.trim())?;
    let text = !cfg.format.eq_ignore_ascii_case("json");

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(text && cfg.output.trim() == "stderr")
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);

    let fmt = if text { fmt.boxed() } else { fmt.json().boxed() };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guard: guard })
}

fn directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn make_writer(output: &str) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    match output {
        "" | "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(directive("DEBUG"), "debug");
        assert_eq!(directive(" warn "), "warn");
        assert_eq!(directive("trace"), "info");
    }

    #[test]
    fn file_output_creates_parent_dirs() {
        let dir = std::env::temp_dir().join(format!("tcptunnel_log_test_{}", std::process::id()));
        let path = dir.join("nested").join("tunnel.log");
        let (_w, _g) = make_writer(path.to_str().unwrap()).unwrap();
        assert!(path.exists());
    }
}

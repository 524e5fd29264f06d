use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LoggingConfig, ProxyConfig};
use crate::proxy::RuntimeProxy;

/// Sets up the global subscriber. Each `-v` raises the level one step past
/// the configured one.
///
/// The returned guard flushes the log file when dropped and must be held
/// for the life of the process.
pub fn init_logging(logging: &LoggingConfig, verbosity: u8) -> Result<Option<WorkerGuard>> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let level = match verbosity {
        0 => logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let level: LevelFilter = level
        .parse()
        .with_context(|| format!("Invalid log level {:?}", level))?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(logging.filter.as_deref().unwrap_or_default());

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .with_target(true)
        .with_thread_ids(true);

    match &logging.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            let subscriber = builder.with_writer(writer).with_ansi(false).finish();
            tracing::subscriber::set_global_default(subscriber).context("Failed to install subscriber")?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = builder.with_writer(std::io::stderr).finish();
            tracing::subscriber::set_global_default(subscriber).context("Failed to install subscriber")?;
            Ok(None)
        }
    }
}

/// Runs the proxy until SIGINT or SIGTERM.
pub async fn run_proxy(config: ProxyConfig) -> Result<()> {
    let backends = config.backends().context("Invalid backend list")?;
    let stream_url = config.stream_base_url().context("Can't get stream url")?;
    info!("Streaming URLs are resolved against {}", stream_url);

    let proxy = RuntimeProxy::new(
        backends,
        Arc::new(config.connector()),
        config.connection_timeout(),
        stream_url,
    )
    .context("Error initializing CRI proxy")?;

    proxy
        .serve(&config.listen, shutdown_signal())
        .await
        .context("Serving failed")?;

    info!("CRI proxy stopped");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

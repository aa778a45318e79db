//! The main server which combines the configuration database and its HTTP transport.

use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use iroh_metrics::Registry;
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::{Config, ConfigError},
    dal::Dal,
    http::HttpServer,
    metrics::Metrics,
    state::AppState,
};

/// Failure to run the server.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    #[snafu(display("invalid configuration"))]
    Config { source: ConfigError },
    #[snafu(display("failed to bind {addr}"))]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[snafu(display("HTTP server failed"))]
    Serve { source: std::io::Error },
    #[snafu(display("server task panicked"))]
    Task { source: tokio::task::JoinError },
    #[snafu(display("failed to wait for the shutdown signal"))]
    Signal { source: std::io::Error },
}

/// Spawn the server and run until the `Ctrl-C` signal is received or the service is shut
/// down over HTTP, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<(), ServerError> {
    let server = Server::spawn(config).await?;
    let dal = server.dal().clone();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context(SignalSnafu)?;
            info!("shutdown");
        }
        _ = dal.closed() => info!("service shut down"),
    }
    server.shutdown().await
}

/// The cdb-dal server.
#[derive(Debug)]
pub struct Server {
    dal: Dal,
    http_server: Option<HttpServer>,
    metrics_task: tokio::task::JoinHandle<()>,
    cancel: CancellationToken,
}

impl Server {
    /// Spawn the server.
    ///
    /// This will spawn several background tasks:
    /// * The memory monitor of the document cache
    /// * A HTTP server task, if `config.http` is not empty
    /// * A metrics server task, unless metrics are disabled
    pub async fn spawn(config: Config) -> Result<Self, ServerError> {
        let metrics = Arc::new(Metrics::default());
        let dal = Dal::builder(config.cdb_root())
            .recovery_file(config.recovery_file().context(ConfigSnafu)?)
            .replay_recovery(config.recovery.replay)
            .memory_limit(config.cache.memory_limit)
            .target_free_ratio(config.cache.target_free_ratio)
            .check_interval(config.cache.check_interval)
            .repeat_guard(config.repeat_guard.window, config.repeat_guard.max_tracked)
            .metrics(metrics.clone())
            .spawn();

        let metrics_addr = config.metrics_addr();
        let metrics_task = tokio::task::spawn(async move {
            if let Some(addr) = metrics_addr {
                let mut registry = Registry::default();
                registry.register(metrics);
                let registry = Arc::new(RwLock::new(registry));
                if let Err(err) = iroh_metrics::service::start_metrics_server(addr, registry).await
                {
                    warn!("metrics server failed: {err}");
                }
            }
        });

        let cancel = CancellationToken::new();
        let state = AppState { dal: dal.clone() };
        let http_server = match config.http {
            Some(http_config) => {
                Some(HttpServer::spawn(http_config, state, cancel.child_token()).await?)
            }
            None => None,
        };
        Ok(Self {
            dal,
            http_server,
            metrics_task,
            cancel,
        })
    }

    /// The configuration database served by this server.
    pub fn dal(&self) -> &Dal {
        &self.dal
    }

    /// Cancel the server tasks and wait for all tasks to complete.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.metrics_task.abort();
        self.cancel.cancel();
        if !self.dal.is_shutdown() {
            if let Err(err) = self.dal.shutdown().await {
                warn!("failed to shut down the service: {err}");
            }
        }
        match self.http_server {
            Some(http_server) => http_server.shutdown().await,
            None => Ok(()),
        }
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run until the HTTP server fails or the service is shut down.
    pub async fn run_until_error(self) -> Result<(), ServerError> {
        let res = match self.http_server {
            Some(http_server) => http_server.run_until_done().await,
            None => {
                self.dal.closed().await;
                Ok(())
            }
        };
        self.metrics_task.abort();
        res
    }

    /// Spawn a server suitable for testing.
    ///
    /// The server serves the node tree in `root` over HTTP on localhost, without metrics
    /// server and recovery file. It returns the server handle and the [`Url`](url::Url) of the
    /// HTTP server.
    #[cfg(test)]
    pub async fn spawn_for_tests(
        root: impl Into<std::path::PathBuf>,
    ) -> testresult::TestResult<(Self, url::Url)> {
        use std::net::{IpAddr, Ipv4Addr};

        use crate::config::{HttpConfig, MetricsConfig};

        let mut config = Config {
            root: root.into(),
            http: Some(HttpConfig {
                port: 0,
                bind_addr: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            }),
            metrics: Some(MetricsConfig::disabled()),
            ..Default::default()
        };
        config.recovery.enabled = false;

        let server = Self::spawn(config).await?;
        let http_addr = server
            .http_server
            .as_ref()
            .map(HttpServer::http_addr)
            .ok_or("http is set")?;
        let http_url = format!("http://{http_addr}").parse()?;
        Ok((server, http_url))
    }
}

//! HTTP server part of cdb-dal

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Instant,
};

use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    middleware::{self, Next},
    response::IntoResponse,
    routing::{delete, get, post},
};
use snafu::ResultExt;
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Level, info, span, warn};

mod dal;
mod error;

use crate::{
    config::HttpConfig,
    server::{BindSnafu, ServeSnafu, ServerError, TaskSnafu},
    state::AppState,
};

/// The HTTP server part of cdb-dal
#[derive(Debug)]
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    http_addr: SocketAddr,
    cancel: CancellationToken,
}

impl HttpServer {
    /// Spawn the server
    ///
    /// The server stops accepting requests when `cancel` is cancelled or the service is shut
    /// down, then finishes the requests in flight.
    pub async fn spawn(
        config: HttpConfig,
        state: AppState,
        cancel: CancellationToken,
    ) -> Result<HttpServer, ServerError> {
        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::UNSPECIFIED.into()),
            config.port,
        );
        let listener = TcpListener::bind(bind_addr)
            .await
            .context(BindSnafu { addr: bind_addr })?;
        let http_addr = listener
            .local_addr()
            .context(BindSnafu { addr: bind_addr })?;

        let dal = state.dal.clone();
        let app = create_app(state);
        let done = cancel.clone();
        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = done.cancelled() => {}
                    _ = dal.closed() => {}
                }
            })
            .await
        });
        info!("HTTP server listening on {http_addr}");

        Ok(HttpServer {
            tasks,
            http_addr,
            cancel,
        })
    }

    /// Get the bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Stop accepting requests and wait for the requests in flight to complete.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.cancel.cancel();
        self.run_until_done().await
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs until the server is shut down or fails.
    pub async fn run_until_done(mut self) -> Result<(), ServerError> {
        let mut final_res = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(err).context(ServeSnafu);
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err).context(TaskSnafu);
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState) -> Router {
    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &Request| {
        let src = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|conn_info| conn_info.0);
        span!(
            Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            src = ?src,
        )
    });

    let router = Router::new()
        .route("/dal/document", get(dal::get_document))
        .route("/dal/dao", post(dal::get_dao))
        .route("/dal/dao/field", get(dal::get_field))
        .route("/dal/nodes", get(dal::list_nodes))
        .route("/dal/daos", get(dal::list_daos))
        .route("/dal/clear", post(dal::clear))
        .route("/dal/clear-all", post(dal::clear_all))
        .route("/dal/listeners", post(dal::add_listener))
        .route("/dal/listeners/{id}", delete(dal::remove_listener))
        .route("/dal/listeners/{id}/subscriptions", post(dal::subscribe))
        .route("/dal/configuration-name", get(dal::configuration_name))
        .route("/dal/shutdown", post(dal::shutdown))
        .route("/healthcheck", get(|| async { "OK" }))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .with_state(state);

    router.layer(trace)
}

/// Record request metrics.
async fn metrics_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    let metrics = state.dal.metrics();
    metrics.http_requests_duration_ms.inc_by(latency as u64);
    metrics.http_requests.inc();
    if status.is_success() {
        metrics.http_requests_success.inc();
    } else {
        metrics.http_requests_error.inc();
    }
    response
}

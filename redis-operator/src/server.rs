//! The operator's HTTP server.
//!
//! Serves liveness and metrics endpoints along with the administrative
//! actions of the managed Redis group.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header::HeaderName, HeaderMap, HeaderValue, StatusCode};
use axum::routing::{get, post, Router};
use axum::{extract, handler::Handler, AddExtensionLayer};
use hyper::server::conn::Http;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::get_metrics_recorder;
use crate::k8s::SecretPeerStore;
use crate::status::StatusHandle;
use crate::workload;
use redis_core::credential::CredentialCoordinator;
use redis_core::{StoreError, PEER_PASSWORD_KEY};

/// Shared state for the action handlers.
#[derive(Clone)]
pub struct ActionContext {
    pub client: kube::Client,
    pub config: Arc<Config>,
    pub status: StatusHandle,
    pub store: SecretPeerStore,
}

/// The HTTP server.
pub struct HttpServer {
    /// The application's runtime config.
    config: Arc<Config>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: broadcast::Receiver<()>,

    /// Shared state handed to the action handlers.
    actions: ActionContext,
    listener: TcpListener,
}

impl HttpServer {
    /// Construct a new instance.
    pub async fn new(config: Arc<Config>, actions: ActionContext, shutdown: broadcast::Sender<()>) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .context("error binding socket address for HTTP server")?;
        Ok(Self {
            config,
            shutdown_rx: shutdown.subscribe(),
            shutdown_tx: shutdown,
            actions,
            listener,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let metrics_handle = get_metrics_recorder(&self.config).handle();
        let router = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/metrics", get(prom_metrics.layer(AddExtensionLayer::new(metrics_handle))))
            .route(
                "/status",
                get(workload_status.layer(AddExtensionLayer::new(self.actions.clone()))),
            )
            .route(
                "/v1/actions/check-service",
                post(
                    check_service
                        .layer(AddExtensionLayer::new(self.actions.clone()))
                        .layer(TraceLayer::new_for_http()),
                ),
            )
            .route(
                "/v1/actions/admin-password",
                get(
                    admin_password
                        .layer(AddExtensionLayer::new(self.actions.clone()))
                        .layer(TraceLayer::new_for_http()),
                ),
            );

        loop {
            tokio::select! {
                sock_res = self.listener.accept() => {
                    let (stream, _addr) = match sock_res {
                        Ok((stream, addr)) => (stream, addr),
                        Err(err) => {
                            tracing::error!(error = ?err, "error accepting HTTP socket connection");
                            let _res = self.shutdown_tx.send(());
                            break;
                        }
                    };
                    let router = router.clone();
                    tokio::spawn(async move {
                        let _res = Http::new().serve_connection(stream, router).await;
                    });
                },
                _ = self.shutdown_rx.recv() => break,
            }
        }

        Ok(())
    }
}

/// Handler for reporting the current workload status.
pub(super) async fn workload_status(extract::Extension(ctx): extract::Extension<ActionContext>) -> (StatusCode, axum::Json<serde_json::Value>) {
    let status = (*ctx.status.get()).clone();
    (StatusCode::OK, axum::Json(json!(status)))
}

/// Action handler reporting whether the managed redis-server is live.
#[tracing::instrument(level = "debug", skip(ctx))]
pub(super) async fn check_service(extract::Extension(ctx): extract::Extension<ActionContext>) -> (StatusCode, axum::Json<serde_json::Value>) {
    match workload::check_managed(&ctx.client, &ctx.config, &ctx.store).await {
        Ok(info) => (StatusCode::OK, axum::Json(json!({"result": "Service is running", "redis-version": info.version}))),
        Err(err) => {
            tracing::debug!(error = ?err, "check-service probe failed");
            (StatusCode::OK, axum::Json(json!({"result": "Service is not running"})))
        }
    }
}

/// Action handler returning the group's admin credential.
#[tracing::instrument(level = "debug", skip(ctx))]
pub(super) async fn admin_password(extract::Extension(ctx): extract::Extension<ActionContext>) -> (StatusCode, axum::Json<serde_json::Value>) {
    let coordinator = CredentialCoordinator::new(ctx.store.clone(), PEER_PASSWORD_KEY);
    match coordinator.retrieve().await {
        Ok(Some(password)) => (StatusCode::OK, axum::Json(json!({"redis-password": password}))),
        Ok(None) => (StatusCode::NOT_FOUND, axum::Json(json!({"error": "admin credential has not been provisioned yet"}))),
        Err(err @ StoreError::Unavailable(_)) => {
            tracing::error!(error = ?err, "error reading admin credential from peer store");
            (StatusCode::SERVICE_UNAVAILABLE, axum::Json(json!({"error": "peer store is unavailable"})))
        }
        Err(err) => {
            tracing::error!(error = ?err, "error reading admin credential from peer store");
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(json!({"error": "error reading admin credential"})))
        }
    }
}

/// Handler for serving Prometheus metrics.
pub(super) async fn prom_metrics(extract::Extension(state): extract::Extension<PrometheusHandle>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(HeaderName::from_static("content-type"), HeaderValue::from_static("text/plain; version=0.0.4"));
    (StatusCode::OK, headers, state.render())
}

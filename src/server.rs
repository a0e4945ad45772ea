//! HTTP/JSON API over a [`Store`].
//!
//! Every endpoint takes a JSON request body and answers with the matching JSON
//! response. Failures carry a serialized [`StoreError`] and a status code
//! derived from it, so the client side can hand the same error back to callers.

use crate::error::StoreError;
use crate::store::Store;
use crate::transport::STATUS_PATH;
use crate::types::{
    CompactionRequest, CompactionResponse, DeleteRangeRequest, DeleteResponse, GetResponse,
    LeaseGrantRequest, LeaseGrantResponse, LeaseKeepAliveRequest, LeaseKeepAliveResponse,
    LeaseRevokeRequest, LeaseRevokeResponse, PutRequest, PutResponse, RangeRequest,
    StatusResponse, WatchRequest, WatchResponse,
};
use anyhow::{Context, Result};
use axum::{
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::{spawn_blocking, JoinHandle};
use tokio::time::interval;
use tracing::{debug, error, info};

/// Longest a watch request may be held open
const MAX_WATCH_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// How often expired leases are revoked
    pub lease_check_interval: Duration,
    /// How often a dirty persistent store is snapshotted
    pub persist_interval: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            lease_check_interval: Duration::from_millis(500),
            persist_interval: Duration::from_secs(10),
        }
    }
}

/// A [`StoreError`] on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub StoreError);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::InvalidArgument(_) | StoreError::FutureRevision { .. } => {
                StatusCode::BAD_REQUEST
            }
            StoreError::LeaseNotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Compacted { .. } => StatusCode::GONE,
            StoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            debug!("Request rejected: {}", self.0);
        }
        (status, Json(self.0)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(store: Store) -> Router {
    Router::new()
        .route("/v3/kv/put", post(handle_put))
        .route("/v3/kv/range", post(handle_range))
        .route("/v3/kv/deleterange", post(handle_delete_range))
        .route("/v3/kv/compaction", post(handle_compaction))
        .route("/v3/watch", post(handle_watch))
        .route("/v3/lease/grant", post(handle_lease_grant))
        .route("/v3/lease/revoke", post(handle_lease_revoke))
        .route("/v3/lease/keepalive", post(handle_lease_keep_alive))
        .route(STATUS_PATH, get(handle_status).post(handle_status))
        .with_state(store)
}

/// Serve until the process exits
pub async fn serve(listener: TcpListener, store: Store, options: ServeOptions) -> Result<()> {
    serve_with_shutdown(listener, store, options, std::future::pending()).await
}

/// Serve until `shutdown` resolves. Background lease and persist tasks stop with the server.
pub async fn serve_with_shutdown<F>(
    listener: TcpListener,
    store: Store,
    options: ServeOptions,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    let reaper = store.spawn_lease_reaper(options.lease_check_interval);
    let persister = store
        .read()
        .status()
        .wal
        .then(|| spawn_persister(store.clone(), options.persist_interval));

    info!("HTTP server listening on {addr}");
    let result = axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed");

    reaper.abort();
    if let Some(persister) = persister {
        persister.abort();
    }
    info!("HTTP server on {addr} stopped");
    result
}

fn spawn_persister(store: Store, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let store = store.clone();
            match spawn_blocking(move || store.persist_if_dirty()).await {
                Ok(Ok(true)) => info!("Periodic persist: wrote snapshot to disk"),
                Ok(Ok(false)) => {}
                Ok(Err(err)) => error!("Periodic persist failed: {err:#}"),
                Err(join_err) => error!("Periodic persist task panicked: {join_err}"),
            }
        }
    })
}

/// Mutations fsync the WAL, so they run off the async workers
async fn blocking<T, F>(store: Store, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(move || f(&store))
        .await
        .map_err(|err| StoreError::Internal(format!("store task failed: {err}")))?
        .map_err(ApiError)
}

async fn handle_put(
    AxumState(store): AxumState<Store>,
    Json(req): Json<PutRequest>,
) -> ApiResult<PutResponse> {
    let resp = blocking(store, move |store| store.write().put(req)).await?;
    Ok(Json(resp))
}

async fn handle_range(
    AxumState(store): AxumState<Store>,
    Json(req): Json<RangeRequest>,
) -> ApiResult<GetResponse> {
    let resp = store.read().range(&req)?;
    Ok(Json(resp))
}

async fn handle_delete_range(
    AxumState(store): AxumState<Store>,
    Json(req): Json<DeleteRangeRequest>,
) -> ApiResult<DeleteResponse> {
    let resp = blocking(store, move |store| store.write().delete_range(req)).await?;
    Ok(Json(resp))
}

async fn handle_compaction(
    AxumState(store): AxumState<Store>,
    Json(req): Json<CompactionRequest>,
) -> ApiResult<CompactionResponse> {
    let resp = blocking(store, move |store| store.write().compact(req)).await?;
    Ok(Json(resp))
}

async fn handle_watch(
    AxumState(store): AxumState<Store>,
    Json(mut req): Json<WatchRequest>,
) -> ApiResult<WatchResponse> {
    req.wait_ms = req.wait_ms.min(MAX_WATCH_WAIT.as_millis() as u64);
    let resp = store.wait_events(req).await?;
    Ok(Json(resp))
}

async fn handle_lease_grant(
    AxumState(store): AxumState<Store>,
    Json(req): Json<LeaseGrantRequest>,
) -> ApiResult<LeaseGrantResponse> {
    let resp = blocking(store, move |store| store.write().lease_grant(req)).await?;
    Ok(Json(resp))
}

async fn handle_lease_revoke(
    AxumState(store): AxumState<Store>,
    Json(req): Json<LeaseRevokeRequest>,
) -> ApiResult<LeaseRevokeResponse> {
    let resp = blocking(store, move |store| store.write().lease_revoke(req)).await?;
    Ok(Json(resp))
}

async fn handle_lease_keep_alive(
    AxumState(store): AxumState<Store>,
    Json(req): Json<LeaseKeepAliveRequest>,
) -> ApiResult<LeaseKeepAliveResponse> {
    let resp = blocking(store, move |store| store.write().lease_keep_alive(req)).await?;
    Ok(Json(resp))
}

async fn handle_status(AxumState(store): AxumState<Store>) -> Json<StatusResponse> {
    Json(store.read().status())
}

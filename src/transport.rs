//! How a [`Client`](crate::client::Client) reaches a store.
//!
//! [`HttpTransport`] speaks the JSON API served by [`crate::server`];
//! [`LocalTransport`] calls an embedded [`Store`] directly. Both bound every
//! call by the configured request timeout.

use crate::client::ClientConfig;
use crate::error::{ConnectionError, StoreError};
use crate::store::Store;
use crate::types::{
    CompactionRequest, CompactionResponse, DeleteRangeRequest, DeleteResponse, GetResponse,
    LeaseGrantRequest, LeaseGrantResponse, LeaseKeepAliveRequest, LeaseKeepAliveResponse,
    LeaseRevokeRequest, LeaseRevokeResponse, PutRequest, PutResponse, RangeRequest,
    StatusResponse, WatchRequest, WatchResponse,
};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One request, one response. Implementations never retry.
pub trait Transport: Clone + Send + Sync + 'static {
    fn put(&self, req: PutRequest) -> impl Future<Output = Result<PutResponse, StoreError>> + Send;

    fn range(
        &self,
        req: RangeRequest,
    ) -> impl Future<Output = Result<GetResponse, StoreError>> + Send;

    fn delete_range(
        &self,
        req: DeleteRangeRequest,
    ) -> impl Future<Output = Result<DeleteResponse, StoreError>> + Send;

    fn compact(
        &self,
        req: CompactionRequest,
    ) -> impl Future<Output = Result<CompactionResponse, StoreError>> + Send;

    /// Long-poll for events; may return an empty event list
    fn watch(
        &self,
        req: WatchRequest,
    ) -> impl Future<Output = Result<WatchResponse, StoreError>> + Send;

    fn lease_grant(
        &self,
        req: LeaseGrantRequest,
    ) -> impl Future<Output = Result<LeaseGrantResponse, StoreError>> + Send;

    fn lease_revoke(
        &self,
        req: LeaseRevokeRequest,
    ) -> impl Future<Output = Result<LeaseRevokeResponse, StoreError>> + Send;

    fn lease_keep_alive(
        &self,
        req: LeaseKeepAliveRequest,
    ) -> impl Future<Output = Result<LeaseKeepAliveResponse, StoreError>> + Send;

    fn status(&self) -> impl Future<Output = Result<StatusResponse, StoreError>> + Send;

    /// Upper bound on a single call
    fn request_timeout(&self) -> Duration;
}

pub(crate) const STATUS_PATH: &str = "/v3/maintenance/status";

/// Turn `host:port` into a base URL; anything with a scheme is kept as is
fn normalize_endpoint(endpoint: &str) -> Result<String, ConnectionError> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return Err(ConnectionError::InvalidEndpoint(endpoint.to_string()));
    }
    if endpoint.contains("://") {
        Ok(endpoint.to_string())
    } else {
        Ok(format!("http://{endpoint}"))
    }
}

/// JSON over HTTP to one selected endpoint
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: Arc<str>,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Probe the configured endpoints in order and keep the first that answers
    /// within the dial timeout.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ConnectionError> {
        if config.endpoints.is_empty() {
            return Err(ConnectionError::NoEndpoints);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ConnectionError::Client(err.to_string()))?;

        let mut last_error = String::from("no endpoint tried");
        for endpoint in &config.endpoints {
            let base = normalize_endpoint(endpoint)?;
            let probe = http
                .get(format!("{base}{STATUS_PATH}"))
                .timeout(config.dial_timeout)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            match probe {
                Ok(_) => {
                    info!(endpoint = %base, "Connected to store");
                    return Ok(Self {
                        http,
                        endpoint: base.into(),
                        request_timeout: config.request_timeout,
                    });
                }
                Err(err) => {
                    warn!(endpoint = %base, "Endpoint unreachable: {err}");
                    last_error = err.to_string();
                }
            }
        }
        Err(ConnectionError::Unreachable {
            endpoints: config.endpoints.join(","),
            reason: last_error,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call<Req, Resp>(&self, path: &str, req: &Req) -> Result<Resp, StoreError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.endpoint);
        debug!(%url, "Sending request");
        let resp = self.http.post(&url).json(req).send().await?;
        decode(resp).await
    }
}

async fn decode<Resp: DeserializeOwned>(resp: reqwest::Response) -> Result<Resp, StoreError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json::<Resp>().await?);
    }
    let body = resp.bytes().await?;
    match serde_json::from_slice::<StoreError>(&body) {
        Ok(err) => Err(err),
        Err(_) => Err(StoreError::Unavailable(format!(
            "{status}: {}",
            String::from_utf8_lossy(&body)
        ))),
    }
}

impl Transport for HttpTransport {
    async fn put(&self, req: PutRequest) -> Result<PutResponse, StoreError> {
        self.call("/v3/kv/put", &req).await
    }

    async fn range(&self, req: RangeRequest) -> Result<GetResponse, StoreError> {
        self.call("/v3/kv/range", &req).await
    }

    async fn delete_range(&self, req: DeleteRangeRequest) -> Result<DeleteResponse, StoreError> {
        self.call("/v3/kv/deleterange", &req).await
    }

    async fn compact(&self, req: CompactionRequest) -> Result<CompactionResponse, StoreError> {
        self.call("/v3/kv/compaction", &req).await
    }

    async fn watch(&self, req: WatchRequest) -> Result<WatchResponse, StoreError> {
        self.call("/v3/watch", &req).await
    }

    async fn lease_grant(&self, req: LeaseGrantRequest) -> Result<LeaseGrantResponse, StoreError> {
        self.call("/v3/lease/grant", &req).await
    }

    async fn lease_revoke(
        &self,
        req: LeaseRevokeRequest,
    ) -> Result<LeaseRevokeResponse, StoreError> {
        self.call("/v3/lease/revoke", &req).await
    }

    async fn lease_keep_alive(
        &self,
        req: LeaseKeepAliveRequest,
    ) -> Result<LeaseKeepAliveResponse, StoreError> {
        self.call("/v3/lease/keepalive", &req).await
    }

    async fn status(&self) -> Result<StatusResponse, StoreError> {
        let url = format!("{}{STATUS_PATH}", self.endpoint);
        let resp = self.http.get(&url).send().await?;
        decode(resp).await
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Direct calls into an embedded store
#[derive(Clone)]
pub struct LocalTransport {
    store: Store,
    request_timeout: Duration,
}

impl LocalTransport {
    pub fn new(store: Store, request_timeout: Duration) -> Self {
        Self {
            store,
            request_timeout,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.request_timeout, fut).await?
    }
}

impl Transport for LocalTransport {
    async fn put(&self, req: PutRequest) -> Result<PutResponse, StoreError> {
        self.bounded(async { self.store.write().put(req) }).await
    }

    async fn range(&self, req: RangeRequest) -> Result<GetResponse, StoreError> {
        self.bounded(async { self.store.read().range(&req) }).await
    }

    async fn delete_range(&self, req: DeleteRangeRequest) -> Result<DeleteResponse, StoreError> {
        self.bounded(async { self.store.write().delete_range(req) })
            .await
    }

    async fn compact(&self, req: CompactionRequest) -> Result<CompactionResponse, StoreError> {
        self.bounded(async { self.store.write().compact(req) }).await
    }

    async fn watch(&self, req: WatchRequest) -> Result<WatchResponse, StoreError> {
        self.bounded(self.store.wait_events(req)).await
    }

    async fn lease_grant(&self, req: LeaseGrantRequest) -> Result<LeaseGrantResponse, StoreError> {
        self.bounded(async { self.store.write().lease_grant(req) })
            .await
    }

    async fn lease_revoke(
        &self,
        req: LeaseRevokeRequest,
    ) -> Result<LeaseRevokeResponse, StoreError> {
        self.bounded(async { self.store.write().lease_revoke(req) })
            .await
    }

    async fn lease_keep_alive(
        &self,
        req: LeaseKeepAliveRequest,
    ) -> Result<LeaseKeepAliveResponse, StoreError> {
        self.bounded(async { self.store.write().lease_keep_alive(req) })
            .await
    }

    async fn status(&self) -> Result<StatusResponse, StoreError> {
        Ok(self.store.read().status())
    }

    fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

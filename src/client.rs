use crate::error::{ConnectionError, StoreError};
use crate::kv::Kv;
use crate::store::Store;
use crate::transport::{HttpTransport, LocalTransport, Transport};
use crate::types::{
    prefix_end, LeaseGrantRequest, LeaseGrantResponse, LeaseId, LeaseKeepAliveRequest,
    LeaseKeepAliveResponse, LeaseRevokeRequest, LeaseRevokeResponse, Revision, StatusResponse,
    WatchRequest, WatchResponse,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` or full URLs, tried in order
    pub endpoints: Vec<String>,
    /// Upper bound on establishing a connection
    pub dial_timeout: Duration,
    /// Upper bound on any single call
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "localhost:2379".to_string(),
                "localhost:22379".to_string(),
                "localhost:32379".to_string(),
            ],
            dial_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Options for [`Client::watch`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    prefix: bool,
    start_revision: Option<Revision>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    /// Replay history from `revision` before delivering live events
    pub fn with_start_revision(mut self, revision: Revision) -> Self {
        self.start_revision = Some(revision);
        self
    }
}

/// A session with the store.
///
/// Handles returned by [`kv`](Self::kv) and [`lease`](Self::lease) share the
/// connection. Closing or dropping the client ends every open watch.
pub struct Client<T: Transport = HttpTransport> {
    transport: T,
    config: ClientConfig,
    shutdown: watch::Sender<bool>,
}

impl Client<HttpTransport> {
    /// Connect to the first reachable endpoint
    pub async fn connect(config: ClientConfig) -> Result<Self, ConnectionError> {
        let transport = HttpTransport::connect(&config).await?;
        Ok(Self::with_transport(transport, config))
    }
}

impl Client<LocalTransport> {
    /// A client bound to an embedded store, no network involved
    pub fn local(store: Store, config: ClientConfig) -> Self {
        let transport = LocalTransport::new(store, config.request_timeout);
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(transport: T, config: ClientConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn kv(&self) -> Kv<T> {
        Kv::new(self.transport.clone())
    }

    pub fn lease(&self) -> Lease<T> {
        Lease {
            transport: self.transport.clone(),
        }
    }

    pub async fn status(&self) -> Result<StatusResponse, StoreError> {
        self.transport.status().await
    }

    /// Open a watch on `key` (or every key under it with [`WatchOptions::with_prefix`]).
    ///
    /// Events arrive on the returned stream in revision order until the
    /// [`Watcher`] is cancelled or the client is closed.
    pub async fn watch(
        &self,
        key: impl Into<Vec<u8>>,
        options: WatchOptions,
    ) -> Result<(Watcher, WatchStream), StoreError> {
        let key = key.into();
        let range_end = options.prefix.then(|| prefix_end(&key));
        let start = match options.start_revision {
            Some(rev) if rev > 0 => rev,
            _ => self.transport.status().await?.header.revision + 1,
        };

        let (tx, rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(watch_loop(
            self.transport.clone(),
            key,
            range_end,
            start,
            tx,
            cancel_rx,
            self.shutdown.subscribe(),
        ));
        Ok((
            Watcher {
                cancel: Some(cancel_tx),
                task: Some(task),
            },
            WatchStream { rx },
        ))
    }

    /// End every open watch and release the connection
    pub fn close(self) {
        info!("Closing client");
    }
}

impl<T: Transport> Drop for Client<T> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn watch_loop<T: Transport>(
    transport: T,
    key: Vec<u8>,
    range_end: Option<Vec<u8>>,
    mut next: Revision,
    tx: mpsc::Sender<Result<WatchResponse, StoreError>>,
    mut cancel: oneshot::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let wait_ms = (transport.request_timeout() / 2).as_millis() as u64;
    debug!(start = next, "Watch started");
    loop {
        let req = WatchRequest {
            key: key.clone(),
            range_end: range_end.clone(),
            start_revision: Some(next),
            wait_ms,
        };
        let result = tokio::select! {
            _ = &mut cancel => break,
            _ = shutdown.changed() => break,
            result = transport.watch(req) => result,
        };
        match result {
            Ok(resp) => {
                let Some(last) = resp.events.last() else {
                    continue;
                };
                next = last.kv.mod_revision + 1;
                // A full channel must not keep cancel from being seen
                let sent = tokio::select! {
                    _ = &mut cancel => break,
                    _ = shutdown.changed() => break,
                    sent = tx.send(Ok(resp)) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(err @ StoreError::Compacted { .. }) => {
                warn!("Watch start revision compacted: {err}");
                tokio::select! {
                    _ = &mut cancel => {}
                    _ = shutdown.changed() => {}
                    _ = tx.send(Err(err)) => {}
                }
                break;
            }
            Err(err) => {
                warn!("Watch request failed, retrying: {err}");
                tokio::select! {
                    _ = &mut cancel => break,
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                }
            }
        }
    }
    debug!("Watch stopped");
}

/// Cancels the watch it was returned with
pub struct Watcher {
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Watcher {
    /// Stop the watch and wait for its background task to exit
    pub async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

/// Receiving side of a watch
pub struct WatchStream {
    rx: mpsc::Receiver<Result<WatchResponse, StoreError>>,
}

impl WatchStream {
    /// Next batch of events; `None` once the watch has ended
    pub async fn message(&mut self) -> Result<Option<WatchResponse>, StoreError> {
        self.rx.recv().await.transpose()
    }
}

/// Lease handle obtained from [`Client::lease`]
#[derive(Clone)]
pub struct Lease<T: Transport> {
    transport: T,
}

impl<T: Transport> Lease<T> {
    /// Grant a lease with a server-chosen id
    pub async fn grant(&self, ttl: i64) -> Result<LeaseGrantResponse, StoreError> {
        self.transport
            .lease_grant(LeaseGrantRequest { ttl, id: None })
            .await
    }

    pub async fn grant_with_id(
        &self,
        ttl: i64,
        id: LeaseId,
    ) -> Result<LeaseGrantResponse, StoreError> {
        self.transport
            .lease_grant(LeaseGrantRequest { ttl, id: Some(id) })
            .await
    }

    /// Revoke a lease and delete every key attached to it
    pub async fn revoke(&self, id: LeaseId) -> Result<LeaseRevokeResponse, StoreError> {
        self.transport
            .lease_revoke(LeaseRevokeRequest { id })
            .await
    }

    /// Push the lease deadline out by its full TTL
    pub async fn keep_alive(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse, StoreError> {
        self.transport
            .lease_keep_alive(LeaseKeepAliveRequest { id })
            .await
    }
}

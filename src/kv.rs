//! The key-value facade.
//!
//! Every method turns into exactly one transport call and hands back the
//! store's response, or its error, untouched. Nothing is cached and nothing is
//! retried. A missing key is an empty [`GetResponse`], never an error.

use crate::error::StoreError;
use crate::transport::Transport;
use crate::types::{
    prefix_end, CompactionRequest, CompactionResponse, DeleteRangeRequest, DeleteResponse,
    GetResponse, LeaseId, PutRequest, PutResponse, RangeRequest, Revision, SortOrder, SortTarget,
};
use tracing::instrument;

/// Options for [`Kv::get_with_options`]
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    range_end: Option<Vec<u8>>,
    prefix: bool,
    from_key: bool,
    revision: Option<Revision>,
    limit: Option<usize>,
    sort_target: SortTarget,
    sort_order: SortOrder,
}

impl GetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match every key starting with the given key
    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    /// Match every key greater than or equal to the given key.
    /// Takes precedence over `with_prefix` and `with_range`.
    pub fn with_from_key(mut self) -> Self {
        self.from_key = true;
        self
    }

    /// Match `[key, end)`
    pub fn with_range(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.range_end = Some(end.into());
        self
    }

    /// Read the keyspace as it was at `revision`
    pub fn with_revision(mut self, revision: Revision) -> Self {
        self.revision = Some(revision);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_sort(mut self, target: SortTarget, order: SortOrder) -> Self {
        self.sort_target = target;
        self.sort_order = order;
        self
    }

    fn into_request(self, key: Vec<u8>) -> RangeRequest {
        let range_end = if self.from_key {
            Some(Vec::new())
        } else if self.prefix {
            Some(prefix_end(&key))
        } else {
            self.range_end
        };
        RangeRequest {
            key,
            range_end,
            revision: self.revision,
            limit: self.limit,
            sort_target: self.sort_target,
            sort_order: self.sort_order,
        }
    }
}

/// Options for [`Kv::put_with_options`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PutOptions {
    lease: Option<LeaseId>,
    prev_kv: bool,
}

impl PutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the key to a lease; it is deleted when the lease expires or is revoked
    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// Options for [`Kv::delete_with_options`]
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    prefix: bool,
    from_key: bool,
    range_end: Option<Vec<u8>>,
    prev_kv: bool,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn with_from_key(mut self) -> Self {
        self.from_key = true;
        self
    }

    pub fn with_range(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.range_end = Some(end.into());
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    fn into_request(self, key: Vec<u8>) -> DeleteRangeRequest {
        let range_end = if self.from_key {
            Some(Vec::new())
        } else if self.prefix {
            Some(prefix_end(&key))
        } else {
            self.range_end
        };
        DeleteRangeRequest {
            key,
            range_end,
            prev_kv: self.prev_kv,
        }
    }
}

/// Key-value handle obtained from [`Client::kv`](crate::client::Client::kv)
#[derive(Clone)]
pub struct Kv<T: Transport> {
    transport: T,
}

impl<T: Transport> Kv<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Insert or overwrite a key. The response header carries the new revision.
    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<PutResponse, StoreError> {
        self.put_with_options(key, value, PutOptions::default())
            .await
    }

    #[instrument(skip_all)]
    pub async fn put_with_options(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        options: PutOptions,
    ) -> Result<PutResponse, StoreError> {
        self.transport
            .put(PutRequest {
                key: key.into(),
                value: value.into(),
                lease: options.lease,
                prev_kv: options.prev_kv,
            })
            .await
    }

    /// Point lookup; zero or one record
    pub async fn get(&self, key: impl Into<Vec<u8>>) -> Result<GetResponse, StoreError> {
        self.get_with_options(key, GetOptions::default()).await
    }

    /// Every key starting with `prefix`, in ascending key order
    pub async fn get_with_prefix(
        &self,
        prefix: impl Into<Vec<u8>>,
    ) -> Result<GetResponse, StoreError> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        self.get_with_options(prefix, options).await
    }

    /// The key as it existed at `revision`; empty if it did not exist then
    pub async fn get_at_revision(
        &self,
        key: impl Into<Vec<u8>>,
        revision: Revision,
    ) -> Result<GetResponse, StoreError> {
        self.get_with_options(key, GetOptions::new().with_revision(revision))
            .await
    }

    #[instrument(skip_all)]
    pub async fn get_with_options(
        &self,
        key: impl Into<Vec<u8>>,
        options: GetOptions,
    ) -> Result<GetResponse, StoreError> {
        self.transport.range(options.into_request(key.into())).await
    }

    /// Remove a key; removing an absent key reports `deleted == 0`
    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> Result<DeleteResponse, StoreError> {
        self.delete_with_options(key, DeleteOptions::default())
            .await
    }

    /// Remove every key starting with `prefix`
    pub async fn delete_with_prefix(
        &self,
        prefix: impl Into<Vec<u8>>,
    ) -> Result<DeleteResponse, StoreError> {
        self.delete_with_options(prefix, DeleteOptions::new().with_prefix())
            .await
    }

    #[instrument(skip_all)]
    pub async fn delete_with_options(
        &self,
        key: impl Into<Vec<u8>>,
        options: DeleteOptions,
    ) -> Result<DeleteResponse, StoreError> {
        self.transport
            .delete_range(options.into_request(key.into()))
            .await
    }

    /// Drop history older than `revision`
    pub async fn compact(&self, revision: Revision) -> Result<CompactionResponse, StoreError> {
        self.transport.compact(CompactionRequest { revision }).await
    }
}

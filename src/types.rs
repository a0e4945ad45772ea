use serde::{Deserialize, Serialize};

/// Global store revision. Every mutation that changes the keyspace advances it by one.
pub type Revision = i64;

/// Handle of a granted lease
pub type LeaseId = i64;

/// Identifier of the store member that served a request
pub type MemberId = u64;

/// A key as it existed at some revision
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Revision of the write that (re)created the key
    pub create_revision: Revision,
    /// Revision of the latest write to the key
    pub mod_revision: Revision,
    /// Number of writes since the key was created; 0 once deleted
    pub version: i64,
    pub lease: Option<LeaseId>,
}

impl std::fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValue")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("value_len", &self.value.len())
            .field("create_revision", &self.create_revision)
            .field("mod_revision", &self.mod_revision)
            .field("version", &self.version)
            .field("lease", &self.lease)
            .finish()
    }
}

impl KeyValue {
    pub fn key_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.key)
    }

    pub fn value_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.value)
    }
}

/// Attached to every response: who answered and at which revision
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseHeader {
    pub member_id: MemberId,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortTarget {
    #[default]
    Key,
    Version,
    Create,
    Mod,
    Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    None,
    Ascend,
    Descend,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lease: Option<LeaseId>,
    /// Return the record that was overwritten, if any
    pub prev_kv: bool,
}

/// Range selection follows the usual convention:
/// - `range_end == None`: only `key`
/// - `range_end == Some([])`: every key `>= key`
/// - otherwise: `[key, range_end)`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RangeRequest {
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
    /// Read the keyspace as of this revision; `None` reads the latest
    pub revision: Option<Revision>,
    pub limit: Option<usize>,
    pub sort_target: SortTarget,
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeleteRangeRequest {
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
    pub prev_kv: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CompactionRequest {
    pub revision: Revision,
}

/// Long-poll for events in a range
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatchRequest {
    pub key: Vec<u8>,
    pub range_end: Option<Vec<u8>>,
    /// First revision of interest; `None` means "after the current revision"
    pub start_revision: Option<Revision>,
    /// How long the store may hold the request open waiting for an event
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaseGrantRequest {
    /// Time to live in seconds
    pub ttl: i64,
    /// Requested id; the store picks one when absent
    pub id: Option<LeaseId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LeaseRevokeRequest {
    pub id: LeaseId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LeaseKeepAliveRequest {
    pub id: LeaseId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

impl PutResponse {
    /// Revision stamped on this write
    pub fn revision(&self) -> Revision {
        self.header.revision
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GetResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    /// More keys matched than `limit` allowed
    pub more: bool,
    /// Number of keys that matched before `limit` was applied
    pub count: u64,
}

impl GetResponse {
    /// First record, for point lookups
    pub fn kv(&self) -> Option<&KeyValue> {
        self.kvs.first()
    }

    pub fn is_empty(&self) -> bool {
        self.kvs.is_empty()
    }

    pub fn revision(&self) -> Revision {
        self.header.revision
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeleteResponse {
    pub header: ResponseHeader,
    pub deleted: u64,
    pub prev_kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompactionResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Put => f.write_str("PUT"),
            EventType::Delete => f.write_str("DELETE"),
        }
    }
}

/// A change to one key. Delete events carry only the key and the revision of the delete.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub kind: EventType,
    pub kv: KeyValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    pub events: Vec<Event>,
    pub compact_revision: Revision,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaseRevokeResponse {
    pub header: ResponseHeader,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LeaseKeepAliveResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub header: ResponseHeader,
    pub compact_revision: Revision,
    pub keys: usize,
    pub leases: usize,
    pub dirty: bool,
    pub wal: bool,
}

/// End of the range that covers every key starting with `prefix`.
///
/// Trailing `0xff` bytes cannot be incremented and are dropped; a prefix made
/// only of `0xff` (or an empty prefix) yields an empty end, i.e. "to the end of
/// the keyspace".
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    Vec::new()
}

/// Whether `key` falls inside the range described by `start` and `range_end`
pub fn in_range(key: &[u8], start: &[u8], range_end: Option<&[u8]>) -> bool {
    match range_end {
        None => key == start,
        Some([]) => key >= start,
        Some(end) => key >= start && key < end,
    }
}

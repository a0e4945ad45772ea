use crate::error::StoreError;
use crate::types::{
    Event, EventType, KeyValue, LeaseId, RangeRequest, Revision, SortOrder, SortTarget,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Atomic state operations - lowest level instructions that mutate CoreState
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StateOp {
    /// Write a value under the next revision
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },

    /// Tombstone every live key in the range under a single revision
    DeleteRange {
        key: Vec<u8>,
        range_end: Option<Vec<u8>>,
    },

    /// Register a lease expiring at an absolute time
    GrantLease {
        id: LeaseId,
        ttl: i64,
        expires_at_ms: i64,
    },

    /// Push a lease deadline forward
    RefreshLease { id: LeaseId, expires_at_ms: i64 },

    /// Drop a lease and tombstone its keys under a single revision
    RevokeLease { id: LeaseId },

    /// Discard history superseded at or before the revision
    Compact { revision: Revision },
}

/// One entry in a key's history. A `None` value is a tombstone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub mod_revision: Revision,
    pub create_revision: Revision,
    pub version: i64,
    pub value: Option<Vec<u8>>,
    pub lease: Option<LeaseId>,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn to_kv(&self, key: &[u8]) -> KeyValue {
        KeyValue {
            key: key.to_vec(),
            value: self.value.clone().unwrap_or_default(),
            create_revision: self.create_revision,
            mod_revision: self.mod_revision,
            version: self.version,
            lease: self.lease,
        }
    }

    fn to_event(&self, key: &[u8]) -> Event {
        let kind = if self.is_tombstone() {
            EventType::Delete
        } else {
            EventType::Put
        };
        Event {
            kind,
            kv: self.to_kv(key),
        }
    }
}

/// Longest lease TTL in seconds, matching etcd's cap
pub const MAX_LEASE_TTL: i64 = 9_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: i64,
    pub expires_at_ms: i64,
    pub keys: BTreeSet<Vec<u8>>,
}

impl Lease {
    pub fn remaining_ttl(&self, now_ms: i64) -> i64 {
        self.expires_at_ms.saturating_sub(now_ms).max(0) / 1000
    }
}

/// Result of a range read before it is wrapped into a response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    pub count: u64,
    pub more: bool,
}

/// Core state: the MVCC keyspace plus leases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreState {
    /// Per-key history, oldest first. BTreeMap keeps range scans ordered by key.
    keys: BTreeMap<Vec<u8>, Vec<Record>>,

    leases: BTreeMap<LeaseId, Lease>,

    /// Revision of the latest mutation; an empty store is at revision 1
    revision: Revision,

    /// Reads below this revision are no longer answerable
    compact_revision: Revision,

    next_lease_id: LeaseId,
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreState {
    pub fn new() -> Self {
        Self {
            keys: BTreeMap::new(),
            leases: BTreeMap::new(),
            revision: 1,
            compact_revision: 0,
            next_lease_id: 1,
        }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn compact_revision(&self) -> Revision {
        self.compact_revision
    }

    pub fn leases(&self) -> &BTreeMap<LeaseId, Lease> {
        &self.leases
    }

    pub fn alloc_lease_id(&self) -> LeaseId {
        self.next_lease_id
    }

    /// Number of keys that are currently live
    pub fn live_keys(&self) -> usize {
        self.keys
            .values()
            .filter(|history| history.last().is_some_and(|r| !r.is_tombstone()))
            .count()
    }

    /// Latest live record of a key
    pub fn latest(&self, key: &[u8]) -> Option<&Record> {
        self.keys
            .get(key)
            .and_then(|history| history.last())
            .filter(|record| !record.is_tombstone())
    }

    /// Live record of a key as of `revision`
    pub fn at(&self, key: &[u8], revision: Revision) -> Option<&Record> {
        let history = self.keys.get(key)?;
        let idx = history.partition_point(|r| r.mod_revision <= revision);
        if idx == 0 {
            return None;
        }
        Some(&history[idx - 1]).filter(|record| !record.is_tombstone())
    }

    fn histories_in_range<'a>(
        &'a self,
        key: &'a [u8],
        range_end: Option<&'a [u8]>,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<Record>)> + 'a {
        self.keys
            .range(key.to_vec()..)
            .take_while(move |(k, _)| match range_end {
                None => k.as_slice() == key,
                Some([]) => true,
                Some(end) => k.as_slice() < end,
            })
    }

    fn live_keys_in_range(&self, key: &[u8], range_end: Option<&[u8]>) -> Vec<Vec<u8>> {
        self.histories_in_range(key, range_end)
            .filter(|(_, history)| history.last().is_some_and(|r| !r.is_tombstone()))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Resolve the revision a read should observe
    pub fn read_revision(&self, requested: Option<Revision>) -> Result<Revision, StoreError> {
        let revision = match requested {
            Some(rev) if rev > 0 => rev,
            _ => return Ok(self.revision),
        };
        if revision < self.compact_revision {
            return Err(StoreError::Compacted {
                requested: revision,
                compact_revision: self.compact_revision,
            });
        }
        if revision > self.revision {
            return Err(StoreError::FutureRevision {
                requested: revision,
                current: self.revision,
            });
        }
        Ok(revision)
    }

    pub fn range(&self, req: &RangeRequest) -> Result<RangeResult, StoreError> {
        let revision = self.read_revision(req.revision)?;
        let mut kvs: Vec<KeyValue> = self
            .histories_in_range(&req.key, req.range_end.as_deref())
            .filter_map(|(k, _)| self.at(k, revision).map(|record| record.to_kv(k)))
            .collect();

        sort_kvs(&mut kvs, req.sort_target, req.sort_order);

        let count = kvs.len() as u64;
        let mut more = false;
        if let Some(limit) = req.limit.filter(|limit| *limit > 0) {
            if kvs.len() > limit {
                kvs.truncate(limit);
                more = true;
            }
        }
        Ok(RangeResult { kvs, count, more })
    }

    /// Every change in the range with `mod_revision >= start`, in revision order
    pub fn events_since(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        start: Revision,
    ) -> Result<Vec<Event>, StoreError> {
        if self.compact_revision > 0 && start <= self.compact_revision {
            return Err(StoreError::Compacted {
                requested: start,
                compact_revision: self.compact_revision,
            });
        }
        let mut events: Vec<Event> = self
            .histories_in_range(key, range_end)
            .flat_map(|(k, history)| {
                let first = history.partition_point(|r| r.mod_revision < start);
                history[first..].iter().map(move |record| record.to_event(k))
            })
            .collect();
        events.sort_by(|a, b| {
            a.kv.mod_revision
                .cmp(&b.kv.mod_revision)
                .then_with(|| a.kv.key.cmp(&b.kv.key))
        });
        Ok(events)
    }

    /// Reject operations that cannot be applied
    pub fn validate(&self, op: &StateOp) -> Result<(), StoreError> {
        match op {
            StateOp::Put { key, lease, .. } => {
                if key.is_empty() {
                    return Err(StoreError::InvalidArgument("key is not provided".into()));
                }
                if let Some(id) = lease {
                    if !self.leases.contains_key(id) {
                        return Err(StoreError::LeaseNotFound(*id));
                    }
                }
                Ok(())
            }
            StateOp::DeleteRange { key, range_end } => {
                if key.is_empty() && range_end.is_none() {
                    return Err(StoreError::InvalidArgument("key is not provided".into()));
                }
                Ok(())
            }
            StateOp::GrantLease { id, ttl, .. } => {
                if *id <= 0 || *id == LeaseId::MAX {
                    return Err(StoreError::InvalidArgument(format!("invalid lease id {id}")));
                }
                if *ttl <= 0 || *ttl > MAX_LEASE_TTL {
                    return Err(StoreError::InvalidArgument(format!("invalid lease ttl {ttl}")));
                }
                if self.leases.contains_key(id) {
                    return Err(StoreError::InvalidArgument(format!("lease {id} already exists")));
                }
                Ok(())
            }
            StateOp::RefreshLease { id, .. } | StateOp::RevokeLease { id } => {
                if !self.leases.contains_key(id) {
                    return Err(StoreError::LeaseNotFound(*id));
                }
                Ok(())
            }
            StateOp::Compact { revision } => {
                if *revision > self.revision {
                    return Err(StoreError::FutureRevision {
                        requested: *revision,
                        current: self.revision,
                    });
                }
                Ok(())
            }
        }
    }

    /// Operations that would not change anything and must not advance the revision
    pub fn is_noop(&self, op: &StateOp) -> bool {
        match op {
            StateOp::Put { .. } => false,
            StateOp::DeleteRange { key, range_end } => {
                self.live_keys_in_range(key, range_end.as_deref()).is_empty()
            }
            StateOp::GrantLease { .. } => false,
            StateOp::RefreshLease { id, expires_at_ms } => self
                .leases
                .get(id)
                .is_some_and(|lease| lease.expires_at_ms == *expires_at_ms),
            StateOp::RevokeLease { .. } => false,
            StateOp::Compact { revision } => *revision <= self.compact_revision,
        }
    }

    /// Execute a state operation - the only way to mutate CoreState.
    /// Returns the key events it produced.
    pub fn execute(&mut self, op: StateOp) -> Vec<Event> {
        match op {
            StateOp::Put { key, value, lease } => {
                self.revision += 1;
                let revision = self.revision;
                let previous = self.latest(&key).cloned();
                if let Some(old_lease) = previous.as_ref().and_then(|r| r.lease) {
                    if Some(old_lease) != lease {
                        self.detach(old_lease, &key);
                    }
                }
                if let Some(id) = lease {
                    if let Some(lease) = self.leases.get_mut(&id) {
                        lease.keys.insert(key.clone());
                    }
                }
                let record = Record {
                    mod_revision: revision,
                    create_revision: previous.as_ref().map_or(revision, |r| r.create_revision),
                    version: previous.as_ref().map_or(1, |r| r.version + 1),
                    value: Some(value),
                    lease,
                };
                let event = record.to_event(&key);
                self.keys.entry(key).or_default().push(record);
                vec![event]
            }
            StateOp::DeleteRange { key, range_end } => {
                let keys = self.live_keys_in_range(&key, range_end.as_deref());
                self.tombstone(keys)
            }
            StateOp::GrantLease {
                id,
                ttl,
                expires_at_ms,
            } => {
                self.leases.insert(
                    id,
                    Lease {
                        id,
                        ttl,
                        expires_at_ms,
                        keys: BTreeSet::new(),
                    },
                );
                self.next_lease_id = self.next_lease_id.max(id.saturating_add(1));
                vec![]
            }
            StateOp::RefreshLease { id, expires_at_ms } => {
                if let Some(lease) = self.leases.get_mut(&id) {
                    lease.expires_at_ms = expires_at_ms;
                }
                vec![]
            }
            StateOp::RevokeLease { id } => {
                let Some(lease) = self.leases.remove(&id) else {
                    return vec![];
                };
                let keys = lease
                    .keys
                    .into_iter()
                    .filter(|k| self.latest(k).is_some_and(|r| r.lease == Some(id)))
                    .collect();
                self.tombstone(keys)
            }
            StateOp::Compact { revision } => {
                self.keys.retain(|_, history| {
                    let idx = history.partition_point(|r| r.mod_revision <= revision);
                    let keep_from = match idx.checked_sub(1) {
                        Some(last) if !history[last].is_tombstone() => last,
                        _ => idx,
                    };
                    history.drain(..keep_from);
                    !history.is_empty()
                });
                self.compact_revision = revision;
                vec![]
            }
        }
    }

    /// Tombstone live keys under one new revision
    fn tombstone(&mut self, keys: Vec<Vec<u8>>) -> Vec<Event> {
        if keys.is_empty() {
            return vec![];
        }
        self.revision += 1;
        let revision = self.revision;
        let mut events = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(old_lease) = self.latest(&key).and_then(|r| r.lease) {
                self.detach(old_lease, &key);
            }
            let record = Record {
                mod_revision: revision,
                create_revision: 0,
                version: 0,
                value: None,
                lease: None,
            };
            events.push(record.to_event(&key));
            self.keys.entry(key).or_default().push(record);
        }
        events
    }

    fn detach(&mut self, lease: LeaseId, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&lease) {
            lease.keys.remove(key);
        }
    }
}

fn sort_kvs(kvs: &mut [KeyValue], target: SortTarget, order: SortOrder) {
    if order == SortOrder::None {
        // Range scans already come out in ascending key order
        return;
    }
    kvs.sort_by(|a, b| {
        let ord = match target {
            SortTarget::Key => a.key.cmp(&b.key),
            SortTarget::Version => a.version.cmp(&b.version),
            SortTarget::Create => a.create_revision.cmp(&b.create_revision),
            SortTarget::Mod => a.mod_revision.cmp(&b.mod_revision),
            SortTarget::Value => a.value.cmp(&b.value),
        };
        match order {
            SortOrder::Descend => ord.reverse(),
            _ => ord,
        }
    });
}

use crate::error::StoreError;
use crate::ops::{CoreState, StateOp};
use crate::types::{
    in_range, CompactionRequest, CompactionResponse, DeleteRangeRequest, DeleteResponse, Event,
    GetResponse, LeaseGrantRequest, LeaseGrantResponse, LeaseId, LeaseKeepAliveRequest,
    LeaseKeepAliveResponse, LeaseRevokeRequest, LeaseRevokeResponse, MemberId, PutRequest,
    PutResponse, RangeRequest, ResponseHeader, Revision, StatusResponse, WatchRequest,
    WatchResponse,
};
use crate::wal::WriteAheadLog;
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use fs_err::{self as fs, File, OpenOptions};
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Core mutable state - all protected by a single RwLock for consistency
pub struct StoreState {
    pub id: MemberId,

    /// MVCC keyspace and leases
    core: CoreState,

    // WAL for durability - included in state to ensure atomic updates
    wal: Option<WriteAheadLog>,

    /// Optional snapshot path for full state persistence
    snapshot_path: Option<PathBuf>,

    /// Change notification for open watches
    watchers: Vec<Watcher>,

    /// Tracks whether state has unpersisted changes
    dirty: bool,
}

struct Watcher {
    key: Vec<u8>,
    range_end: Option<Vec<u8>>,
    sender: watch::Sender<()>,
}

impl Watcher {
    fn matches(&self, key: &[u8]) -> bool {
        in_range(key, &self.key, self.range_end.as_deref())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    magic: [u8; 4],
    version: u32,
    member_id: MemberId,
    core: CoreState,
}

impl SnapshotFile {
    const VERSION: u32 = 1;
    const MAGIC: [u8; 4] = *b"RVKV";

    fn from_state(state: &StoreState) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            member_id: state.id,
            core: state.core.clone(),
        }
    }

    fn validate(&self, expected_member: MemberId) -> Result<()> {
        if self.magic != Self::MAGIC {
            bail!("Invalid snapshot magic header");
        }
        if self.version != Self::VERSION {
            bail!(
                "Unsupported snapshot version: expected {}, found {}",
                Self::VERSION,
                self.version
            );
        }
        if self.member_id != expected_member {
            bail!(
                "Snapshot member_id mismatch: expected {}, found {}",
                expected_member,
                self.member_id
            );
        }
        Ok(())
    }
}

/// Single-member revisioned key-value store:
/// - in-memory MVCC keyspace with a global revision counter
/// - every mutation is a `StateOp`, logged to the WAL before it is applied
/// - one RwLock protects keyspace, WAL and watchers together
#[derive(Clone)]
pub struct Store {
    state: Arc<RwLock<StoreState>>,
}

impl StoreState {
    fn snapshot_path(&self) -> Result<&Path> {
        self.snapshot_path
            .as_deref()
            .ok_or_else(|| anyhow!("Snapshot path not configured"))
    }

    fn load_snapshot_if_exists(&mut self) -> Result<bool> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }

        let mut reader = BufReader::new(File::open(&path)?);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        let (snapshot, _): (SnapshotFile, _) =
            bincode::serde::decode_from_slice(&buf, bincode::config::standard())
                .context("Failed to deserialize snapshot")?;
        snapshot.validate(self.id)?;

        self.core = snapshot.core;
        self.dirty = false;
        Ok(true)
    }

    pub fn persist_to_disk(&mut self) -> Result<()> {
        let snapshot_path = self.snapshot_path()?.to_path_buf();
        if let Some(parent) = snapshot_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = snapshot_path.with_extension("snapshot.tmp");
        let encoded = bincode::serde::encode_to_vec(
            SnapshotFile::from_state(self),
            bincode::config::standard(),
        )?;
        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            writer.write_all(&encoded)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &snapshot_path)?;

        if let Some(parent) = snapshot_path.parent() {
            if let Ok(dir_file) = File::open(parent) {
                let _ = dir_file.sync_all();
            }
        }

        if let Some(wal) = self.wal.as_mut() {
            wal.reset()?;
        }

        info!(
            revision = self.core.revision(),
            "Persisted snapshot to {:?}", snapshot_path
        );
        self.dirty = false;
        Ok(())
    }

    fn notify_watchers(&mut self, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        self.watchers.retain(|watcher| {
            if watcher.sender.is_closed() {
                return false;
            }
            if events.iter().any(|event| watcher.matches(&event.kv.key)) {
                watcher.sender.send(()).is_ok()
            } else {
                true
            }
        });
    }

    /// Subscribe to changes in a key range. The receiver fires after any event in the range.
    pub fn watch_range(&mut self, key: &[u8], range_end: Option<&[u8]>) -> watch::Receiver<()> {
        self.watchers.retain(|watcher| !watcher.sender.is_closed());
        let (sender, receiver) = watch::channel(());
        self.watchers.push(Watcher {
            key: key.to_vec(),
            range_end: range_end.map(<[u8]>::to_vec),
            sender,
        });
        receiver
    }

    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Execute state operations with WAL logging.
    /// This is the ONLY method that mutates state - all mutations go through here
    fn execute_ops(&mut self, ops: Vec<StateOp>) -> Result<Vec<Event>, StoreError> {
        self.execute_ops_impl(ops, true)
    }

    fn execute_ops_impl(
        &mut self,
        ops: Vec<StateOp>,
        write_to_wal: bool,
    ) -> Result<Vec<Event>, StoreError> {
        let mut events = Vec::new();
        for op in ops {
            if self.core.is_noop(&op) {
                trace!("Skipping noop op: {op:?}");
                continue;
            }
            if let Err(err) = self.core.validate(&op) {
                if write_to_wal {
                    return Err(err);
                }
                warn!("Skipping op that no longer applies during replay: {err}");
                continue;
            }
            if write_to_wal {
                if let Some(wal) = self.wal.as_mut() {
                    wal.write_op(&op)?;
                }
            }
            let produced = self.core.execute(op);
            self.notify_watchers(&produced);
            events.extend(produced);
            self.mark_dirty();
        }
        Ok(events)
    }

    /// Execute ops during recovery (no WAL writing)
    fn replay_ops(&mut self, ops: Vec<StateOp>) -> Result<()> {
        self.execute_ops_impl(ops, false)
            .map_err(|err| anyhow!("Failed to replay WAL: {err}"))?;
        Ok(())
    }

    fn header(&self) -> ResponseHeader {
        ResponseHeader {
            member_id: self.id,
            revision: self.core.revision(),
        }
    }

    pub fn revision(&self) -> Revision {
        self.core.revision()
    }

    pub fn put(&mut self, req: PutRequest) -> Result<PutResponse, StoreError> {
        let prev_kv = if req.prev_kv {
            self.core.latest(&req.key).map(|record| record.to_kv(&req.key))
        } else {
            None
        };
        self.execute_ops(vec![StateOp::Put {
            key: req.key,
            value: req.value,
            lease: req.lease,
        }])?;
        Ok(PutResponse {
            header: self.header(),
            prev_kv,
        })
    }

    pub fn range(&self, req: &RangeRequest) -> Result<GetResponse, StoreError> {
        let result = self.core.range(req)?;
        Ok(GetResponse {
            header: self.header(),
            kvs: result.kvs,
            more: result.more,
            count: result.count,
        })
    }

    pub fn delete_range(&mut self, req: DeleteRangeRequest) -> Result<DeleteResponse, StoreError> {
        let prev_kvs = if req.prev_kv {
            self.core
                .range(&RangeRequest {
                    key: req.key.clone(),
                    range_end: req.range_end.clone(),
                    ..Default::default()
                })?
                .kvs
        } else {
            Vec::new()
        };
        let events = self.execute_ops(vec![StateOp::DeleteRange {
            key: req.key,
            range_end: req.range_end,
        }])?;
        Ok(DeleteResponse {
            header: self.header(),
            deleted: events.len() as u64,
            prev_kvs,
        })
    }

    pub fn compact(&mut self, req: CompactionRequest) -> Result<CompactionResponse, StoreError> {
        self.execute_ops(vec![StateOp::Compact {
            revision: req.revision,
        }])?;
        info!(revision = req.revision, "Compacted keyspace");
        Ok(CompactionResponse {
            header: self.header(),
        })
    }

    pub fn lease_grant(&mut self, req: LeaseGrantRequest) -> Result<LeaseGrantResponse, StoreError> {
        let id = req.id.unwrap_or_else(|| self.core.alloc_lease_id());
        let expires_at_ms = Utc::now()
            .timestamp_millis()
            .saturating_add(req.ttl.saturating_mul(1000));
        self.execute_ops(vec![StateOp::GrantLease {
            id,
            ttl: req.ttl,
            expires_at_ms,
        }])?;
        debug!(id, ttl = req.ttl, "Granted lease");
        Ok(LeaseGrantResponse {
            header: self.header(),
            id,
            ttl: req.ttl,
        })
    }

    pub fn lease_revoke(&mut self, req: LeaseRevokeRequest) -> Result<LeaseRevokeResponse, StoreError> {
        let events = self.execute_ops(vec![StateOp::RevokeLease { id: req.id }])?;
        debug!(id = req.id, keys = events.len(), "Revoked lease");
        Ok(LeaseRevokeResponse {
            header: self.header(),
        })
    }

    pub fn lease_keep_alive(
        &mut self,
        req: LeaseKeepAliveRequest,
    ) -> Result<LeaseKeepAliveResponse, StoreError> {
        let now = Utc::now().timestamp_millis();
        // A lease past its deadline is gone even if the reaper has not run yet
        let ttl = self
            .core
            .leases()
            .get(&req.id)
            .filter(|lease| lease.expires_at_ms > now)
            .map(|lease| lease.ttl)
            .ok_or(StoreError::LeaseNotFound(req.id))?;
        let expires_at_ms = now.saturating_add(ttl.saturating_mul(1000));
        self.execute_ops(vec![StateOp::RefreshLease {
            id: req.id,
            expires_at_ms,
        }])?;
        Ok(LeaseKeepAliveResponse {
            header: self.header(),
            id: req.id,
            ttl,
        })
    }

    /// Remaining time to live of a lease in seconds
    pub fn lease_ttl(&self, id: LeaseId) -> Option<i64> {
        let now = Utc::now().timestamp_millis();
        self.core.leases().get(&id).map(|lease| lease.remaining_ttl(now))
    }

    /// Revoke every lease whose deadline has passed
    pub fn expire_leases(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        let expired: Vec<StateOp> = self
            .core
            .leases()
            .values()
            .filter(|lease| lease.expires_at_ms <= now_ms)
            .map(|lease| StateOp::RevokeLease { id: lease.id })
            .collect();
        let count = expired.len();
        if count > 0 {
            let events = self.execute_ops(expired)?;
            info!(leases = count, keys = events.len(), "Expired leases");
        }
        Ok(count)
    }

    pub fn events_since(
        &self,
        key: &[u8],
        range_end: Option<&[u8]>,
        start: Revision,
    ) -> Result<WatchResponse, StoreError> {
        let events = self.core.events_since(key, range_end, start)?;
        Ok(WatchResponse {
            header: self.header(),
            events,
            compact_revision: self.core.compact_revision(),
        })
    }

    fn persist_if_dirty(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        self.persist_to_disk()?;
        Ok(true)
    }

    #[inline]
    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Get store status (for debugging/monitoring)
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            header: self.header(),
            compact_revision: self.core.compact_revision(),
            keys: self.core.live_keys(),
            leases: self.core.leases().len(),
            dirty: self.dirty,
            wal: self.wal.is_some(),
        }
    }
}

impl Store {
    pub fn new(id: MemberId) -> Self {
        let state = StoreState {
            id,
            core: CoreState::new(),
            wal: None, // No WAL by default
            snapshot_path: None,
            watchers: Vec::new(),
            dirty: false,
        };

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Create a store that logs every mutation and can snapshot to `data_dir`
    pub fn new_with_persistence<P: Into<PathBuf>>(id: MemberId, data_dir: P) -> Result<Self> {
        let data_dir = data_dir.into();
        let wal_path = data_dir.join(format!("member_{id}.wal"));
        let snapshot_path = data_dir.join(format!("member_{id}.snapshot"));

        fs::create_dir_all(&data_dir)?;

        let wal = WriteAheadLog::new(&wal_path, id)?;
        let existing_ops = wal.read_all_ops()?;

        let mut state = StoreState {
            id,
            core: CoreState::new(),
            wal: Some(wal),
            snapshot_path: Some(snapshot_path.clone()),
            watchers: Vec::new(),
            dirty: false,
        };

        if state.load_snapshot_if_exists()? {
            info!("Loaded snapshot from {}", snapshot_path.display());
            info!("Store status: {:?}", state.status());
        }

        if !existing_ops.is_empty() {
            info!(
                "Recovering {} state operations from WAL",
                existing_ops.len()
            );
            state.replay_ops(existing_ops)?;
            info!("Store status after recovery: {:?}", state.status());
        }

        info!(
            "Persistence enabled: WAL={:?}, snapshot={:?}",
            wal_path, snapshot_path
        );
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn write(&self) -> RwLockWriteGuard<StoreState> {
        self.state.write().expect("Failed to lock store state")
    }

    pub fn read(&self) -> RwLockReadGuard<StoreState> {
        self.state.read().expect("Failed to lock store state")
    }

    /// Persist current state to disk snapshot (resets WAL)
    pub fn persist(&self) -> Result<()> {
        self.write().persist_to_disk()
    }

    pub fn persist_if_dirty(&self) -> Result<bool> {
        self.write().persist_if_dirty()
    }

    /// Long-poll for events in a range.
    ///
    /// Returns as soon as at least one event at or after the start revision
    /// exists, or with an empty event list once `wait_ms` has elapsed.
    pub async fn wait_events(&self, req: WatchRequest) -> Result<WatchResponse, StoreError> {
        let deadline = Instant::now() + Duration::from_millis(req.wait_ms);
        let range_end = req.range_end.as_deref();
        // Subscribe before reading so a write between the two is not missed
        let mut changed = self.write().watch_range(&req.key, range_end);
        let start = match req.start_revision {
            Some(rev) if rev > 0 => rev,
            _ => self.read().revision() + 1,
        };
        loop {
            let resp = self.read().events_since(&req.key, range_end, start)?;
            if !resp.events.is_empty() {
                return Ok(resp);
            }
            match timeout_at(deadline, changed.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Ok(resp),
            }
        }
    }

    /// Periodically revoke expired leases until the returned task is aborted
    pub fn spawn_lease_reaper(&self, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Utc::now().timestamp_millis();
                if let Err(err) = store.write().expire_leases(now) {
                    warn!("Lease expiry failed: {err}");
                }
            }
        })
    }
}

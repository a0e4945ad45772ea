//! Walking a key's history backwards through revisions.

use crate::error::StoreError;
use crate::kv::Kv;
use crate::transport::Transport;
use crate::types::{KeyValue, PutResponse, Revision};
use tracing::{debug, info};

/// The key as seen by a historical read at `revision`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionSnapshot {
    pub revision: Revision,
    pub kv: KeyValue,
}

/// Read `key` at every revision from `from` down to 1, stopping at the first
/// revision where it is absent.
///
/// Revisions where the key did not change repeat the previous snapshot. A
/// compacted revision ends the walk with what was collected so far.
pub async fn walk_back<T: Transport>(
    kv: &Kv<T>,
    key: &[u8],
    from: Revision,
) -> Result<Vec<RevisionSnapshot>, StoreError> {
    let mut snapshots = Vec::new();
    let mut revision = from;
    while revision >= 1 {
        let resp = match kv.get_at_revision(key, revision).await {
            Ok(resp) => resp,
            Err(StoreError::Compacted { .. }) => {
                debug!(revision, "Walk reached compacted history");
                break;
            }
            Err(err) => return Err(err),
        };
        let Some(found) = resp.kvs.into_iter().next() else {
            break;
        };
        snapshots.push(RevisionSnapshot {
            revision,
            kv: found,
        });
        revision -= 1;
    }
    Ok(snapshots)
}

/// Every version of `key` since it was last created, newest first.
///
/// Jumps straight to `mod_revision - 1` after each read, so it costs one
/// read per version instead of one per revision.
pub async fn versions<T: Transport>(
    kv: &Kv<T>,
    key: &[u8],
) -> Result<Vec<KeyValue>, StoreError> {
    let mut found = Vec::new();
    let Some(mut current) = kv.get(key).await?.kvs.into_iter().next() else {
        return Ok(found);
    };
    loop {
        let prev = current.mod_revision - 1;
        let create = current.create_revision;
        found.push(current);
        if prev < create {
            break;
        }
        let resp = match kv.get_at_revision(key, prev).await {
            Ok(resp) => resp,
            Err(StoreError::Compacted { .. }) => break,
            Err(err) => return Err(err),
        };
        match resp.kvs.into_iter().next() {
            Some(record) => current = record,
            None => break,
        }
    }
    Ok(found)
}

/// Write the fixed probe value used by the tour
pub async fn put_probe<T: Transport>(kv: &Kv<T>) -> Result<PutResponse, StoreError> {
    let resp = kv.put("key1", "444").await?;
    info!(revision = resp.revision(), "Wrote probe key1=444");
    Ok(resp)
}

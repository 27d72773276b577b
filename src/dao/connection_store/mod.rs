/// In-process store.
pub mod memory;
/// MongoDB-backed store.
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use std::time::SystemTime;

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::dao::{
    models::{ConnectionKey, ConnectionRecord},
    storage::{CommitOutcome, StorageResult},
};

/// Latest row of a key as seen by a writer about to supersede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predecessor {
    /// Id of the superseded row.
    pub id: Uuid,
    /// Version of the row when it was read.
    pub version: u64,
}

impl Predecessor {
    /// Pin `record` at its current version.
    pub fn of(record: &ConnectionRecord) -> Self {
        Self {
            id: record.id,
            version: record.version,
        }
    }
}

/// Abstraction over the persistence layer for connection records.
///
/// Writes are conditional so that every logical transition is one atomic
/// read-modify-write without a lock held across the service layer:
/// an insert only lands if `record.seq` is the next free sequence number of its
/// key and the current latest row is still `predecessor`, an update only lands if
/// the stored row still has `expected_version`. A successful insert bumps the
/// version of the superseded row, so updates computed from it fail afterwards.
pub trait ConnectionStore: Send + Sync {
    /// Latest record (highest `seq`) for the key.
    fn latest(&self, key: ConnectionKey)
    -> BoxFuture<'static, StorageResult<Option<ConnectionRecord>>>;
    /// Records of the key updated at or after `since`, oldest first.
    fn history(
        &self,
        key: ConnectionKey,
        since: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Vec<ConnectionRecord>>>;
    /// Insert a new latest record on top of `predecessor` (`None` for the first row).
    fn insert(
        &self,
        record: ConnectionRecord,
        predecessor: Option<Predecessor>,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>>;
    /// Replace the stored row with the same id if its version is `expected_version`.
    fn update(
        &self,
        record: ConnectionRecord,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>>;
    /// Check that the backend is reachable.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}

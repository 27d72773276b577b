use std::{sync::Arc, time::SystemTime};

use dashmap::DashMap;
use futures::future::{self, BoxFuture};

use super::{ConnectionStore, Predecessor};
use crate::dao::{
    models::{ConnectionKey, ConnectionRecord},
    storage::{CommitOutcome, StorageResult},
};

/// Process-local store keeping every record of a key in insertion order.
///
/// Each write holds the key's shard lock for the duration of its check and
/// mutation, which gives the same conditional-write guarantees as the database
/// backends.
#[derive(Clone, Default)]
pub struct MemoryConnectionStore {
    rows: Arc<DashMap<ConnectionKey, Vec<ConnectionRecord>>>,
}

impl MemoryConnectionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records stored for the key, terminal ones included.
    pub fn record_count(&self, key: &ConnectionKey) -> usize {
        self.rows.get(key).map_or(0, |rows| rows.len())
    }

    fn insert_now(
        &self,
        record: ConnectionRecord,
        predecessor: Option<Predecessor>,
    ) -> CommitOutcome {
        let mut rows = self.rows.entry(record.key()).or_default();
        let next_seq = rows.last().map_or(0, |latest| latest.seq + 1);
        if record.seq != next_seq {
            return CommitOutcome::Conflict;
        }
        match (rows.last_mut(), predecessor) {
            (None, None) => {}
            (Some(latest), Some(expected))
                if latest.id == expected.id && latest.version == expected.version =>
            {
                latest.version += 1;
            }
            _ => return CommitOutcome::Conflict,
        }
        rows.push(record);
        CommitOutcome::Committed
    }

    fn update_now(&self, record: ConnectionRecord, expected_version: u64) -> CommitOutcome {
        let Some(mut rows) = self.rows.get_mut(&record.key()) else {
            return CommitOutcome::Conflict;
        };
        match rows.iter_mut().find(|row| row.id == record.id) {
            Some(row) if row.version == expected_version => {
                *row = record;
                CommitOutcome::Committed
            }
            _ => CommitOutcome::Conflict,
        }
    }
}

impl ConnectionStore for MemoryConnectionStore {
    fn latest(
        &self,
        key: ConnectionKey,
    ) -> BoxFuture<'static, StorageResult<Option<ConnectionRecord>>> {
        let latest = self
            .rows
            .get(&key)
            .and_then(|rows| rows.last().cloned());
        Box::pin(future::ready(Ok(latest)))
    }

    fn history(
        &self,
        key: ConnectionKey,
        since: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Vec<ConnectionRecord>>> {
        let rows = self
            .rows
            .get(&key)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.updated_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Box::pin(future::ready(Ok(rows)))
    }

    fn insert(
        &self,
        record: ConnectionRecord,
        predecessor: Option<Predecessor>,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>> {
        Box::pin(future::ready(Ok(self.insert_now(record, predecessor))))
    }

    fn update(
        &self,
        record: ConnectionRecord,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>> {
        Box::pin(future::ready(Ok(self.update_now(record, expected_version))))
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(future::ready(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::dao::models::PresenceContext;

    fn key() -> ConnectionKey {
        ConnectionKey::new(7, PresenceContext::room(42))
    }

    #[tokio::test]
    async fn insert_requires_next_sequence_number() {
        let store = MemoryConnectionStore::new();
        let now = UNIX_EPOCH + Duration::from_secs(1_000);

        let first = ConnectionRecord::open(key(), 0, now, None);
        let pinned = Predecessor::of(&first);
        assert_eq!(store.insert(first, None).await.unwrap(), CommitOutcome::Committed);

        let stale = ConnectionRecord::open(key(), 0, now, None);
        assert_eq!(store.insert(stale, None).await.unwrap(), CommitOutcome::Conflict);

        let second = ConnectionRecord::open(key(), 1, now, None);
        let second_id = second.id;
        assert_eq!(
            store.insert(second, Some(pinned)).await.unwrap(),
            CommitOutcome::Committed
        );

        let latest = store.latest(key()).await.unwrap().unwrap();
        assert_eq!(latest.id, second_id);
        assert_eq!(store.record_count(&key()), 2);
    }

    #[tokio::test]
    async fn update_rejects_stale_version() {
        let store = MemoryConnectionStore::new();
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let record = ConnectionRecord::open(key(), 0, now, None);
        store.insert(record.clone(), None).await.unwrap();

        let mut first = record.clone();
        first.version = 1;
        assert_eq!(
            store.update(first, 0).await.unwrap(),
            CommitOutcome::Committed
        );

        let mut second = record;
        second.version = 1;
        assert_eq!(
            store.update(second, 0).await.unwrap(),
            CommitOutcome::Conflict
        );
    }

    #[tokio::test]
    async fn history_filters_on_update_time() {
        let store = MemoryConnectionStore::new();
        let early = UNIX_EPOCH + Duration::from_secs(1_000);
        let late = early + Duration::from_secs(3_600);

        let first = ConnectionRecord::open(key(), 0, early, None);
        let pinned = Predecessor::of(&first);
        store.insert(first, None).await.unwrap();
        store
            .insert(ConnectionRecord::open(key(), 1, late, None), Some(pinned))
            .await
            .unwrap();

        let rows = store
            .history(key(), late - Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].seq, 1);
    }

    #[tokio::test]
    async fn insert_requires_unchanged_predecessor() {
        let store = MemoryConnectionStore::new();
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let first = ConnectionRecord::open(key(), 0, now, None);
        let pinned = Predecessor::of(&first);
        store.insert(first.clone(), None).await.unwrap();

        // A concurrent writer moves the predecessor after it was read.
        let mut moved = first.clone();
        moved.version = 1;
        store.update(moved, 0).await.unwrap();

        let next = ConnectionRecord::open(key(), 1, now, None);
        assert_eq!(
            store.insert(next, Some(pinned)).await.unwrap(),
            CommitOutcome::Conflict
        );
        assert_eq!(store.record_count(&key()), 1);
    }

    #[tokio::test]
    async fn superseded_row_rejects_stale_updates() {
        let store = MemoryConnectionStore::new();
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let first = ConnectionRecord::open(key(), 0, now, None);
        store.insert(first.clone(), None).await.unwrap();
        store
            .insert(
                ConnectionRecord::open(key(), 1, now, None),
                Some(Predecessor::of(&first)),
            )
            .await
            .unwrap();

        let mut late = first;
        late.version = 1;
        assert_eq!(store.update(late, 0).await.unwrap(), CommitOutcome::Conflict);
    }
}

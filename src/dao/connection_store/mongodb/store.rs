use std::{sync::Arc, time::SystemTime};

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database, IndexModel,
    bson::{DateTime, doc},
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::IndexOptions,
};
use tracing::debug;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{MongoConnectionDocument, key_filter, versioned_id_filter},
};
use crate::dao::{
    connection_store::{ConnectionStore, Predecessor},
    models::{ConnectionKey, ConnectionRecord},
    storage::{CommitOutcome, StorageResult},
};

const CONNECTION_COLLECTION_NAME: &str = "connections";
const DUPLICATE_KEY_CODE: i32 = 11000;

/// [`ConnectionStore`] persisting records in MongoDB.
///
/// Conditional inserts first claim the predecessor by bumping its version with a
/// version-filtered update, then rely on the unique `(subject, context, seq)`
/// index: a concurrent writer that moved the predecessor or claimed the same
/// sequence number makes our insert a conflict.
#[derive(Clone)]
pub struct MongoConnectionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    database: Database,
}

impl MongoConnectionStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (_client, database) = establish_connection(&config).await?;
        let store = Self {
            inner: Arc::new(MongoInner { database }),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    /// Database handle shared with the subject directory.
    pub fn database(&self) -> Database {
        self.inner.database.clone()
    }

    fn collection(&self) -> Collection<MongoConnectionDocument> {
        self.inner
            .database
            .collection::<MongoConnectionDocument>(CONNECTION_COLLECTION_NAME)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let index = IndexModel::builder()
            .keys(doc! {"subject_id": 1, "context_type": 1, "context_id": 1, "seq": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("connection_seq_idx".to_owned()))
                    .unique(Some(true))
                    .build(),
            )
            .build();

        self.collection()
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: CONNECTION_COLLECTION_NAME,
                index: "subject_id,context_type,context_id,seq",
                source,
            })?;

        Ok(())
    }

    async fn find_latest(&self, key: ConnectionKey) -> MongoResult<Option<ConnectionRecord>> {
        let document = self
            .collection()
            .find_one(key_filter(key))
            .sort(doc! {"seq": -1})
            .await
            .map_err(|source| MongoDaoError::LoadRecords { key, source })?;

        document.map(ConnectionRecord::try_from).transpose()
    }

    async fn find_history(
        &self,
        key: ConnectionKey,
        since: SystemTime,
    ) -> MongoResult<Vec<ConnectionRecord>> {
        let mut filter = key_filter(key);
        filter.insert("updated_at", doc! {"$gte": DateTime::from_system_time(since)});

        let documents: Vec<MongoConnectionDocument> = self
            .collection()
            .find(filter)
            .sort(doc! {"seq": 1})
            .await
            .map_err(|source| MongoDaoError::LoadRecords { key, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::LoadRecords { key, source })?;

        documents
            .into_iter()
            .map(ConnectionRecord::try_from)
            .collect()
    }

    async fn insert_record(
        &self,
        record: ConnectionRecord,
        predecessor: Option<Predecessor>,
    ) -> MongoResult<CommitOutcome> {
        let key = record.key();
        let id = record.id;

        if let Some(expected) = predecessor
            && !self.claim_predecessor(key, expected).await?
        {
            debug!(%key, record_id = %id, predecessor = %expected.id, "predecessor moved");
            return Ok(CommitOutcome::Conflict);
        }

        let document = MongoConnectionDocument::from(record);

        match self.collection().insert_one(&document).await {
            Ok(_) => Ok(CommitOutcome::Committed),
            Err(err) if is_duplicate_key(&err) => {
                debug!(%key, record_id = %id, "sequence number already taken");
                Ok(CommitOutcome::Conflict)
            }
            Err(source) => Err(MongoDaoError::WriteRecord {
                key,
                id: id.to_string(),
                source,
            }),
        }
    }

    async fn claim_predecessor(
        &self,
        key: ConnectionKey,
        expected: Predecessor,
    ) -> MongoResult<bool> {
        let result = self
            .collection()
            .update_one(
                versioned_id_filter(expected.id, expected.version),
                doc! {"$inc": {"version": 1_i64}},
            )
            .await
            .map_err(|source| MongoDaoError::WriteRecord {
                key,
                id: expected.id.to_string(),
                source,
            })?;
        Ok(result.matched_count > 0)
    }

    async fn replace_record(
        &self,
        record: ConnectionRecord,
        expected_version: u64,
    ) -> MongoResult<CommitOutcome> {
        let key = record.key();
        let id = record.id;
        let document = MongoConnectionDocument::from(record);

        let result = self
            .collection()
            .replace_one(versioned_id_filter(id, expected_version), &document)
            .await
            .map_err(|source| MongoDaoError::WriteRecord {
                key,
                id: id.to_string(),
                source,
            })?;

        if result.matched_count == 0 {
            Ok(CommitOutcome::Conflict)
        } else {
            Ok(CommitOutcome::Committed)
        }
    }

    async fn ping(&self) -> MongoResult<()> {
        self.inner
            .database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write_error))
            if write_error.code == DUPLICATE_KEY_CODE
    )
}

impl ConnectionStore for MongoConnectionStore {
    fn latest(
        &self,
        key: ConnectionKey,
    ) -> BoxFuture<'static, StorageResult<Option<ConnectionRecord>>> {
        let store = self.clone();
        Box::pin(async move { store.find_latest(key).await.map_err(Into::into) })
    }

    fn history(
        &self,
        key: ConnectionKey,
        since: SystemTime,
    ) -> BoxFuture<'static, StorageResult<Vec<ConnectionRecord>>> {
        let store = self.clone();
        Box::pin(async move { store.find_history(key, since).await.map_err(Into::into) })
    }

    fn insert(
        &self,
        record: ConnectionRecord,
        predecessor: Option<Predecessor>,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .insert_record(record, predecessor)
                .await
                .map_err(Into::into)
        })
    }

    fn update(
        &self,
        record: ConnectionRecord,
        expected_version: u64,
    ) -> BoxFuture<'static, StorageResult<CommitOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .replace_record(record, expected_version)
                .await
                .map_err(Into::into)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ping().await.map_err(Into::into) })
    }
}

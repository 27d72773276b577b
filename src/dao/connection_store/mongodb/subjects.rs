use futures::future::BoxFuture;
use mongodb::{
    Database,
    bson::{Document, doc},
};

use super::error::MongoDaoError;
use crate::dao::{
    models::SubjectId,
    storage::StorageResult,
    subjects::SubjectDirectory,
};

const USER_COLLECTION_NAME: &str = "users";

/// [`SubjectDirectory`] backed by the `users` collection.
///
/// Soft-deleted users keep their document (with `deleted_at` set), so they are
/// still reported as existing.
#[derive(Clone)]
pub struct MongoSubjectDirectory {
    database: Database,
}

impl MongoSubjectDirectory {
    /// Look subjects up in `database`.
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

impl SubjectDirectory for MongoSubjectDirectory {
    fn subject_exists(&self, subject_id: SubjectId) -> BoxFuture<'static, StorageResult<bool>> {
        let collection = self.database.collection::<Document>(USER_COLLECTION_NAME);
        Box::pin(async move {
            let count = collection
                .count_documents(doc! {"_id": subject_id})
                .limit(1)
                .await
                .map_err(|source| MongoDaoError::SubjectLookup { subject_id, source })?;
            Ok(count > 0)
        })
    }
}

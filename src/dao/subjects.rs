use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{self, BoxFuture};

use crate::dao::{models::SubjectId, storage::StorageResult};

/// Lookup of the subjects (users) presence can be tracked for.
pub trait SubjectDirectory: Send + Sync {
    /// Whether the subject exists. Soft-deleted subjects must be reported as existing so
    /// that their connections can still be cleaned up.
    fn subject_exists(&self, subject_id: SubjectId) -> BoxFuture<'static, StorageResult<bool>>;
}

/// Registration status of a subject in the in-memory directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectStatus {
    /// Regular account.
    Active,
    /// Account deleted but retained.
    SoftDeleted,
}

/// Process-local [`SubjectDirectory`].
#[derive(Clone, Default)]
pub struct MemorySubjectDirectory {
    subjects: Arc<DashMap<SubjectId, SubjectStatus>>,
    accept_unknown: bool,
}

impl MemorySubjectDirectory {
    /// Directory that only knows the subjects registered on it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory treating every positive identifier as an existing subject, for
    /// deployments without a user database.
    pub fn accept_all() -> Self {
        Self {
            subjects: Arc::default(),
            accept_unknown: true,
        }
    }

    /// Register an active subject.
    pub fn register(&self, subject_id: SubjectId) {
        self.subjects.insert(subject_id, SubjectStatus::Active);
    }

    /// Mark a subject as soft-deleted, registering it if needed.
    pub fn soft_delete(&self, subject_id: SubjectId) {
        self.subjects.insert(subject_id, SubjectStatus::SoftDeleted);
    }

    fn exists(&self, subject_id: SubjectId) -> bool {
        self.subjects.contains_key(&subject_id) || (self.accept_unknown && subject_id > 0)
    }
}

impl SubjectDirectory for MemorySubjectDirectory {
    fn subject_exists(&self, subject_id: SubjectId) -> BoxFuture<'static, StorageResult<bool>> {
        Box::pin(future::ready(Ok(self.exists(subject_id))))
    }
}

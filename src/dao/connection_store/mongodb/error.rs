use mongodb::error::Error as MongoError;
use thiserror::Error;

use crate::dao::models::{ConnectionKey, SubjectId};

/// Result alias for MongoDB backend operations.
pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Failures of the MongoDB backend.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    /// The connection URI could not be parsed.
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        /// Offending URI.
        uri: String,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// The driver rejected the client options.
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// The server never answered during startup.
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last driver error.
        #[source]
        source: MongoError,
    },
    /// A periodic ping failed.
    #[error("MongoDB ping health check failed")]
    HealthPing {
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// An index could not be created.
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        /// Collection the index belongs to.
        collection: &'static str,
        /// Index name.
        index: &'static str,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Reading the records of a key failed.
    #[error("failed to load connection records of {key}")]
    LoadRecords {
        /// Key being read.
        key: ConnectionKey,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// Writing a record failed for a reason other than a lost race.
    #[error("failed to write connection record `{id}` of {key}")]
    WriteRecord {
        /// Key being written.
        key: ConnectionKey,
        /// Record identifier.
        id: String,
        /// Driver error.
        #[source]
        source: MongoError,
    },
    /// A stored document could not be mapped back to a record.
    #[error("stored connection record `{id}` is corrupt: {reason}")]
    CorruptRecord {
        /// Document identifier.
        id: String,
        /// What could not be decoded.
        reason: String,
    },
    /// Looking up a subject failed.
    #[error("failed to look up subject {subject_id}")]
    SubjectLookup {
        /// Subject being looked up.
        subject_id: SubjectId,
        /// Driver error.
        #[source]
        source: MongoError,
    },
}

mod config;
mod connection;
mod error;
mod models;
/// Connection records collection.
pub mod store;
/// Subject lookup over the subjects collection.
pub mod subjects;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoConnectionStore;
pub use subjects::MongoSubjectDirectory;

use crate::dao::storage::StorageError;

impl From<MongoDaoError> for StorageError {
    fn from(err: MongoDaoError) -> Self {
        StorageError::unavailable(err.to_string(), err)
    }
}

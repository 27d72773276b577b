/// Connection record persistence.
pub mod connection_store;
/// Connection record and context definitions.
pub mod models;
/// Storage abstraction layer for database operations.
pub mod storage;
/// Subject existence lookup.
pub mod subjects;

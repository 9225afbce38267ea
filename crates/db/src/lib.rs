//! `db` crate: Postgres persistence for the swarm core.
//!
//! Provides a connection pool, typed row structs, repository functions for the
//! blob and ledger-archive tables, and [`PgBlobStore`], the durable
//! implementation of [`fabric::BlobStore`]. No business logic lives here.

pub mod blob_store;
pub mod error;
pub mod models;
pub mod pool;
pub mod repository;

pub use blob_store::PgBlobStore;
pub use error::DbError;
pub use pool::DbPool;

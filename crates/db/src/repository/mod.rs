//! Repository functions, one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Plain SQL; business logic and domain types live elsewhere.

pub mod blobs;
pub mod ledger;

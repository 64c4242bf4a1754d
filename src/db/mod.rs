//! Database module: the SQLite-backed local store.
//!
//! - `model`: raw row shapes and their conversion into domain types.
//! - `repo`: SQL-only functions plus `SqliteStore`, which exposes them through
//!   the `storage` capability traits.
//!
//! External modules should import from `pickup_sync::db`; the repository API
//! is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

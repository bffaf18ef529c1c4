//! Transactional persistence for the agreement engine.
//!
//! The [`Store`] trait covers every collection the engine reads or writes:
//! agreements, conversations, legacy records, order snapshots, the ledger,
//! wallets and the retry queue. Two backends are provided:
//! - [`InMemoryStore`] for tests and single-process runs
//! - [`PostgresStore`] backed by `sqlx`

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, MemoryTx};
pub use postgres::PostgresStore;
pub use store::{CollectionCounts, Store};

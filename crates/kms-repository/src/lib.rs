//! Tenant-scoped persistence for the key-management system (spec component
//! C3). Two concrete backends share one `Repository` contract: an embedded
//! SQLite mode for single-node deployments and a networked PostgreSQL mode
//! for clustered ones. An in-memory backend backs unit tests.

pub mod backend;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod sqlite;

pub use backend::{BoxFuture, Repository, TxScope};
pub use error::RepositoryError;
pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use record::{Entity, Record};
pub use sqlite::SqliteRepository;

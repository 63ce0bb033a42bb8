//! Persistence (C3). `kms-core` does not own a storage backend of its
//! own — `KeyMetadata` is just another [`kms_repository::Entity`], so the
//! keystore persists it through whichever `kms_repository::Repository` the
//! caller wires up (in-memory for tests, SQLite for a single node, Postgres
//! for a cluster). Every query here is tenant-scoped by construction: the
//! `Repository` trait takes `tenant_id` on every method, so there is no
//! call path that can read across realms.
//!
//! This module re-exports the pieces `kms-core` call sites need so callers
//! don't have to depend on `kms-repository` directly just to construct a
//! `Keystore`.

pub use kms_repository::{
    BoxFuture, Entity, InMemoryRepository, PostgresRepository, Record, Repository,
    RepositoryError, SqliteRepository, TxScope,
};

use crate::types::KeyMetadata;

/// The repository shape every `Keystore` needs: tenant-scoped CRUD over
/// key metadata.
pub type KeyRepository = dyn Repository<KeyMetadata>;

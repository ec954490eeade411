//! Persistent record store for vmrelay
//!
//! Holds the `vms` table (one row per provisioned virtual machine, with its
//! inbound rules embedded as an ordered JSON list) and the typed [`VmStore`]
//! query layer on top of it. The store provides durability and query
//! correctness only; serializing writers is the allocation coordinator's job.

pub mod entities;
pub mod migrator;
pub mod store;

pub use store::{NewVm, StoreError, VmStore};

use sea_orm::{Database, DatabaseConnection, DbErr};
use sea_orm_migration::MigratorTrait;

/// Connect to the database at the given URL (e.g. `sqlite://vmrelay.db?mode=rwc`
/// or `sqlite::memory:` for tests).
pub async fn connect(url: &str) -> Result<DatabaseConnection, DbErr> {
    Database::connect(url).await
}

/// Run all pending migrations.
pub async fn migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    migrator::Migrator::up(db, None).await
}

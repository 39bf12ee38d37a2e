//! Relational store boundary for the sync engine: the `SyncStore` contract plus
//! Postgres and in-memory implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use fuelsync_core::{
    FuelPriceUpsert, PriceSubmission, ReconciliationKey, StationUpsert, SyncMode, SyncStateRecord,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::{MemoryStore, StoredFuelPrice, StoredStation};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "fuelsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("sync system user {0} does not exist")]
    SystemUserMissing(String),
}

/// Every write the sync orchestrator performs. Each call is its own statement;
/// nothing here spans a transaction across calls.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Creates the service account that owns audit rows, or refreshes it by email.
    async fn ensure_system_user(&self) -> Result<(), StoreError>;

    async fn system_user_id(&self) -> Result<Uuid, StoreError>;

    /// External code (trimmed, upper-case) to internal fuel type id.
    async fn fuel_type_mappings(&self) -> Result<HashMap<String, Uuid>, StoreError>;

    /// Returns `false` when the code was already mapped.
    async fn insert_fuel_type_mapping(
        &self,
        external_code: &str,
        fuel_type_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Upsert by reconciliation key; returns the internal station id.
    async fn upsert_station(&self, station: &StationUpsert) -> Result<Uuid, StoreError>;

    /// Lookup by reconciliation key. A key without a state matches the most
    /// recently updated station carrying that code.
    async fn find_station_id(&self, key: &ReconciliationKey) -> Result<Option<Uuid>, StoreError>;

    async fn upsert_fuel_price(&self, price: &FuelPriceUpsert) -> Result<(), StoreError>;

    /// Returns `true` only when a new audit row was written.
    async fn insert_submission_if_new(
        &self,
        submission: &PriceSubmission,
    ) -> Result<bool, StoreError>;

    async fn sync_state(&self, sync_key: &str) -> Result<Option<SyncStateRecord>, StoreError>;

    /// Stamps `last_success_at` and the column for `mode`, clearing `last_error`.
    async fn record_success(&self, sync_key: &str, mode: SyncMode) -> Result<(), StoreError>;

    async fn record_error(&self, sync_key: &str, message: &str) -> Result<(), StoreError>;
}

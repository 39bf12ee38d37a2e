use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuelsync_core::{
    normalize_fuel_code, FuelPriceUpsert, PriceSubmission, ReconciliationKey, StationUpsert,
    SyncMode, SyncStateRecord, PRICE_CURRENCY, PRICE_UNIT, SUBMISSION_METHOD,
    SYSTEM_USER_DISPLAY_NAME, SYSTEM_USER_EMAIL,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::{StoreError, SyncStore};

/// Password hash placeholder that no login flow can ever match.
const SYSTEM_USER_PASSWORD_HASH: &str = "service_nsw_sync_disabled_login";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct SyncStateRow {
    sync_key: String,
    last_success_at: Option<DateTime<Utc>>,
    last_reference_sync_at: Option<DateTime<Utc>>,
    last_full_sync_at: Option<DateTime<Utc>>,
    last_incremental_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl From<SyncStateRow> for SyncStateRecord {
    fn from(row: SyncStateRow) -> Self {
        Self {
            sync_key: row.sync_key,
            last_success_at: row.last_success_at,
            last_reference_sync_at: row.last_reference_sync_at,
            last_full_sync_at: row.last_full_sync_at,
            last_incremental_sync_at: row.last_incremental_sync_at,
            last_error: row.last_error,
        }
    }
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn success_column(mode: SyncMode) -> &'static str {
    match mode {
        SyncMode::Reference => "last_reference_sync_at",
        SyncMode::Full => "last_full_sync_at",
        SyncMode::Incremental => "last_incremental_sync_at",
    }
}

#[async_trait]
impl SyncStore for PgStore {
    async fn ensure_system_user(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, display_name, tier, email_verified, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'free', true, NOW(), NOW())
            ON CONFLICT (email)
            DO UPDATE SET display_name = EXCLUDED.display_name, updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(SYSTEM_USER_EMAIL)
        .bind(SYSTEM_USER_PASSWORD_HASH)
        .bind(SYSTEM_USER_DISPLAY_NAME)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn system_user_id(&self) -> Result<Uuid, StoreError> {
        let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM users WHERE email = $1")
            .bind(SYSTEM_USER_EMAIL)
            .fetch_optional(&self.pool)
            .await?;
        id.ok_or_else(|| StoreError::SystemUserMissing(SYSTEM_USER_EMAIL.to_string()))
    }

    async fn fuel_type_mappings(&self) -> Result<HashMap<String, Uuid>, StoreError> {
        let rows: Vec<(String, Uuid)> = sqlx::query_as(
            "SELECT external_code, fuel_type_id FROM service_nsw_fuel_type_mappings",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(code, id)| (normalize_fuel_code(&code), id))
            .collect())
    }

    async fn insert_fuel_type_mapping(
        &self,
        external_code: &str,
        fuel_type_id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO service_nsw_fuel_type_mappings (external_code, fuel_type_id, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (external_code) DO NOTHING
            "#,
        )
        .bind(normalize_fuel_code(external_code))
        .bind(fuel_type_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_station(&self, station: &StationUpsert) -> Result<Uuid, StoreError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO stations (
                id, name, brand, address, latitude, longitude,
                operating_hours, amenities, last_verified_at,
                service_nsw_station_code, service_nsw_station_id, service_nsw_state,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                '', '[]'::jsonb, NOW(),
                $7, $8, $9,
                NOW(), NOW()
            )
            ON CONFLICT (service_nsw_state, service_nsw_station_code)
            WHERE service_nsw_station_code IS NOT NULL AND service_nsw_station_code <> ''
            DO UPDATE SET
                name = EXCLUDED.name,
                brand = EXCLUDED.brand,
                address = EXCLUDED.address,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                service_nsw_station_id = EXCLUDED.service_nsw_station_id,
                last_verified_at = NOW(),
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&station.name)
        .bind(&station.brand)
        .bind(&station.address)
        .bind(station.latitude)
        .bind(station.longitude)
        .bind(station.key.code())
        .bind(&station.external_station_id)
        .bind(station.key.state())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn find_station_id(&self, key: &ReconciliationKey) -> Result<Option<Uuid>, StoreError> {
        let id: Option<Uuid> = if key.has_state() {
            sqlx::query_scalar(
                r#"
                SELECT id
                  FROM stations
                 WHERE service_nsw_state = $1 AND service_nsw_station_code = $2
                "#,
            )
            .bind(key.state())
            .bind(key.code())
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                r#"
                SELECT id
                  FROM stations
                 WHERE service_nsw_station_code = $1
                 ORDER BY updated_at DESC
                 LIMIT 1
                "#,
            )
            .bind(key.code())
            .fetch_optional(&self.pool)
            .await?
        };
        Ok(id)
    }

    async fn upsert_fuel_price(&self, price: &FuelPriceUpsert) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO fuel_prices (
                id, station_id, fuel_type_id, price, currency, unit, last_updated_at,
                verification_status, confirmation_count, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4::numeric, $5, $6, $7, 'verified', 1, NOW(), NOW())
            ON CONFLICT (station_id, fuel_type_id)
            DO UPDATE SET
                price = EXCLUDED.price,
                currency = EXCLUDED.currency,
                unit = EXCLUDED.unit,
                last_updated_at = EXCLUDED.last_updated_at,
                verification_status = 'verified',
                confirmation_count = fuel_prices.confirmation_count + 1,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(price.station_id)
        .bind(price.fuel_type_id)
        .bind(price.price)
        .bind(PRICE_CURRENCY)
        .bind(PRICE_UNIT)
        .bind(price.observed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_submission_if_new(
        &self,
        submission: &PriceSubmission,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO price_submissions (
                id, user_id, station_id, fuel_type_id, price,
                submission_method, submitted_at, moderation_status,
                verification_confidence, ocr_data, source_hash,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5::numeric, $6, $7, 'approved', 1.0, NULL, $8, NOW(), NOW())
            ON CONFLICT (source_hash) WHERE source_hash IS NOT NULL DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(submission.user_id)
        .bind(submission.station_id)
        .bind(submission.fuel_type_id)
        .bind(submission.price)
        .bind(SUBMISSION_METHOD)
        .bind(submission.submitted_at)
        .bind(&submission.source_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn sync_state(&self, sync_key: &str) -> Result<Option<SyncStateRecord>, StoreError> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            r#"
            SELECT sync_key, last_success_at, last_reference_sync_at,
                   last_full_sync_at, last_incremental_sync_at, last_error
              FROM service_nsw_sync_state
             WHERE sync_key = $1
            "#,
        )
        .bind(sync_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn record_success(&self, sync_key: &str, mode: SyncMode) -> Result<(), StoreError> {
        let column = success_column(mode);
        let sql = format!(
            r#"
            INSERT INTO service_nsw_sync_state (sync_key, last_success_at, {column}, last_error, updated_at)
            VALUES ($1, NOW(), NOW(), NULL, NOW())
            ON CONFLICT (sync_key)
            DO UPDATE SET
                last_success_at = NOW(),
                {column} = NOW(),
                last_error = NULL,
                updated_at = NOW()
            "#
        );
        sqlx::query(&sql).bind(sync_key).execute(&self.pool).await?;
        Ok(())
    }

    async fn record_error(&self, sync_key: &str, message: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO service_nsw_sync_state (sync_key, last_error, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (sync_key)
            DO UPDATE SET
                last_error = EXCLUDED.last_error,
                updated_at = NOW()
            "#,
        )
        .bind(sync_key)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_mode_stamps_its_own_column() {
        assert_eq!(success_column(SyncMode::Reference), "last_reference_sync_at");
        assert_eq!(success_column(SyncMode::Full), "last_full_sync_at");
        assert_eq!(success_column(SyncMode::Incremental), "last_incremental_sync_at");
    }
}

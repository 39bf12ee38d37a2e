use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuelsync_core::{
    normalize_fuel_code, FuelPriceUpsert, PriceSubmission, ReconciliationKey, StationUpsert,
    SyncMode, SyncStateRecord, SYSTEM_USER_EMAIL,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{StoreError, SyncStore};

#[derive(Debug, Clone, PartialEq)]
pub struct StoredStation {
    pub id: Uuid,
    pub fields: StationUpsert,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFuelPrice {
    pub price: f64,
    pub last_updated_at: DateTime<Utc>,
    pub verification_status: String,
    pub confirmation_count: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, Uuid>,
    mappings: BTreeMap<String, Uuid>,
    stations: BTreeMap<ReconciliationKey, StoredStation>,
    fuel_prices: HashMap<(Uuid, Uuid), StoredFuelPrice>,
    submissions: Vec<PriceSubmission>,
    source_hashes: HashSet<String>,
    sync_states: HashMap<String, SyncStateRecord>,
    revision: u64,
}

/// Process-local store with the same conflict semantics as the Postgres tables.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stations(&self) -> Vec<StoredStation> {
        self.state.lock().await.stations.values().cloned().collect()
    }

    pub async fn fuel_price(&self, station_id: Uuid, fuel_type_id: Uuid) -> Option<StoredFuelPrice> {
        self.state
            .lock()
            .await
            .fuel_prices
            .get(&(station_id, fuel_type_id))
            .cloned()
    }

    pub async fn fuel_price_count(&self) -> usize {
        self.state.lock().await.fuel_prices.len()
    }

    pub async fn submissions(&self) -> Vec<PriceSubmission> {
        self.state.lock().await.submissions.clone()
    }

    pub async fn user_count(&self) -> usize {
        self.state.lock().await.users.len()
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn ensure_system_user(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .users
            .entry(SYSTEM_USER_EMAIL.to_string())
            .or_insert_with(Uuid::new_v4);
        Ok(())
    }

    async fn system_user_id(&self) -> Result<Uuid, StoreError> {
        self.state
            .lock()
            .await
            .users
            .get(SYSTEM_USER_EMAIL)
            .copied()
            .ok_or_else(|| StoreError::SystemUserMissing(SYSTEM_USER_EMAIL.to_string()))
    }

    async fn fuel_type_mappings(&self) -> Result<HashMap<String, Uuid>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .mappings
            .iter()
            .map(|(code, id)| (code.clone(), *id))
            .collect())
    }

    async fn insert_fuel_type_mapping(
        &self,
        external_code: &str,
        fuel_type_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let code = normalize_fuel_code(external_code);
        if state.mappings.contains_key(&code) {
            return Ok(false);
        }
        state.mappings.insert(code, fuel_type_id);
        Ok(true)
    }

    async fn upsert_station(&self, station: &StationUpsert) -> Result<Uuid, StoreError> {
        let mut state = self.state.lock().await;
        state.revision += 1;
        let revision = state.revision;
        let entry = state
            .stations
            .entry(station.key.clone())
            .or_insert_with(|| StoredStation {
                id: Uuid::new_v4(),
                fields: station.clone(),
                revision,
            });
        entry.fields = station.clone();
        entry.revision = revision;
        Ok(entry.id)
    }

    async fn find_station_id(&self, key: &ReconciliationKey) -> Result<Option<Uuid>, StoreError> {
        let state = self.state.lock().await;
        if key.has_state() {
            return Ok(state.stations.get(key).map(|s| s.id));
        }
        Ok(state
            .stations
            .values()
            .filter(|s| s.fields.key.code() == key.code())
            .max_by_key(|s| s.revision)
            .map(|s| s.id))
    }

    async fn upsert_fuel_price(&self, price: &FuelPriceUpsert) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let row = state
            .fuel_prices
            .entry((price.station_id, price.fuel_type_id))
            .or_insert_with(|| StoredFuelPrice {
                price: price.price,
                last_updated_at: price.observed_at,
                verification_status: "verified".to_string(),
                confirmation_count: 0,
            });
        row.price = price.price;
        row.last_updated_at = price.observed_at;
        row.verification_status = "verified".to_string();
        row.confirmation_count += 1;
        Ok(())
    }

    async fn insert_submission_if_new(
        &self,
        submission: &PriceSubmission,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.source_hashes.insert(submission.source_hash.clone()) {
            return Ok(false);
        }
        state.submissions.push(submission.clone());
        Ok(true)
    }

    async fn sync_state(&self, sync_key: &str) -> Result<Option<SyncStateRecord>, StoreError> {
        Ok(self.state.lock().await.sync_states.get(sync_key).cloned())
    }

    async fn record_success(&self, sync_key: &str, mode: SyncMode) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let record = state
            .sync_states
            .entry(sync_key.to_string())
            .or_insert_with(|| SyncStateRecord {
                sync_key: sync_key.to_string(),
                ..SyncStateRecord::default()
            });
        record.last_success_at = Some(now);
        match mode {
            SyncMode::Reference => record.last_reference_sync_at = Some(now),
            SyncMode::Full => record.last_full_sync_at = Some(now),
            SyncMode::Incremental => record.last_incremental_sync_at = Some(now),
        }
        record.last_error = None;
        Ok(())
    }

    async fn record_error(&self, sync_key: &str, message: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let record = state
            .sync_states
            .entry(sync_key.to_string())
            .or_insert_with(|| SyncStateRecord {
                sync_key: sync_key.to_string(),
                ..SyncStateRecord::default()
            });
        record.last_error = Some(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuelsync_core::SYNC_KEY;

    fn station(state: &str, code: &str, name: &str) -> StationUpsert {
        StationUpsert {
            key: ReconciliationKey::new(state, code).expect("key"),
            external_station_id: format!("ext-{code}"),
            name: name.to_string(),
            brand: "Ampol".to_string(),
            address: "1 Test St".to_string(),
            latitude: -33.0,
            longitude: 151.0,
        }
    }

    #[tokio::test]
    async fn station_upsert_keeps_id_and_overwrites_fields() {
        let store = MemoryStore::new();
        let first = store
            .upsert_station(&station("NSW", "1001", "Old Name"))
            .await
            .expect("first");
        let second = store
            .upsert_station(&station("NSW", "1001", "New Name"))
            .await
            .expect("second");
        assert_eq!(first, second);
        let stations = store.stations().await;
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].fields.name, "New Name");
    }

    #[tokio::test]
    async fn stateless_lookup_prefers_most_recent_station() {
        let store = MemoryStore::new();
        store
            .upsert_station(&station("NSW", "55", "Sydney"))
            .await
            .expect("nsw");
        let tas = store
            .upsert_station(&station("TAS", "55", "Hobart"))
            .await
            .expect("tas");
        let key = ReconciliationKey::new("", "55").expect("key");
        assert_eq!(store.find_station_id(&key).await.expect("lookup"), Some(tas));
        let missing = ReconciliationKey::new("VIC", "55").expect("key");
        assert_eq!(store.find_station_id(&missing).await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn mappings_are_immutable_once_inserted() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        assert!(store.insert_fuel_type_mapping("e10", a).await.expect("insert"));
        assert!(!store
            .insert_fuel_type_mapping(" E10 ", Uuid::new_v4())
            .await
            .expect("insert"));
        assert_eq!(store.fuel_type_mappings().await.expect("load")["E10"], a);
    }

    #[tokio::test]
    async fn sync_state_tracks_success_and_error() {
        let store = MemoryStore::new();
        store.record_error(SYNC_KEY, "boom").await.expect("error");
        let state = store.sync_state(SYNC_KEY).await.expect("load").expect("row");
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert!(state.last_success_at.is_none());

        store
            .record_success(SYNC_KEY, SyncMode::Incremental)
            .await
            .expect("success");
        let state = store.sync_state(SYNC_KEY).await.expect("load").expect("row");
        assert!(state.last_error.is_none());
        assert!(state.last_incremental_sync_at.is_some());
        assert!(state.last_full_sync_at.is_none());
    }

    #[tokio::test]
    async fn system_user_must_exist_before_lookup() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.system_user_id().await,
            Err(StoreError::SystemUserMissing(_))
        ));
        store.ensure_system_user().await.expect("ensure");
        store.ensure_system_user().await.expect("ensure again");
        assert_eq!(store.user_count().await, 1);
        assert!(store.system_user_id().await.is_ok());
    }
}

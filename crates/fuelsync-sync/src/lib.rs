//! Service NSW price sync: environment config, the run orchestrator and its
//! manual triggers. The background loop lives in [`scheduler`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fuelsync_adapters::{FeedError, PriceFeed, ServiceNswClient, ServiceNswConfig};
use fuelsync_core::{
    default_fuel_type_id, normalize_fuel_code, normalize_price_cents, parse_observed_at,
    source_hash, FuelPriceUpsert, PriceSnapshot, PriceSubmission, ReconciliationKey, SyncMode,
    SyncStateRecord, SyncSummary, SYNC_KEY,
};
use fuelsync_storage::{StoreError, SyncStore};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod scheduler;

pub const CRATE_NAME: &str = "fuelsync-sync";

pub const DEFAULT_BASE_URL: &str = "https://api.onegov.nsw.gov.au";
pub const DEFAULT_STATES: &str = "NSW|TAS";
/// Reference data is refreshed on a fixed daily cadence.
pub const REFERENCE_SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_INCREMENTAL_MINUTES: u64 = 60;
const MIN_INCREMENTAL_MINUTES: u64 = 5;
const DEFAULT_FULL_SYNC_HOURS: u64 = 24;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const MIN_REQUEST_TIMEOUT_SECS: u64 = 5;
/// Upper bound for any configured interval or timeout; keeps timer deadlines
/// representable.
const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub base_url: String,
    pub states: String,
    pub api_key: String,
    pub api_secret: String,
    pub incremental_interval: Duration,
    pub full_sync_interval: Duration,
    pub request_timeout: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same rules as [`SyncConfig::from_env`] against an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<i64>().ok());

        let incremental_minutes = match number("SERVICE_NSW_INCREMENTAL_INTERVAL_MINUTES") {
            Some(m) if m < MIN_INCREMENTAL_MINUTES as i64 => MIN_INCREMENTAL_MINUTES,
            Some(m) => m as u64,
            None => DEFAULT_INCREMENTAL_MINUTES,
        };
        let full_hours = match number("SERVICE_NSW_FULL_SYNC_INTERVAL_HOURS") {
            Some(h) if h >= 1 => h as u64,
            _ => DEFAULT_FULL_SYNC_HOURS,
        };
        let timeout_secs = match number("SERVICE_NSW_REQUEST_TIMEOUT_SECONDS") {
            Some(s) if s >= MIN_REQUEST_TIMEOUT_SECS as i64 => s as u64,
            _ => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Self {
            enabled: lookup("SERVICE_NSW_SYNC_ENABLED")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            base_url: lookup("SERVICE_NSW_BASE_URL")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            states: lookup("SERVICE_NSW_SYNC_STATES")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_STATES.to_string()),
            api_key: lookup("SERVICE_NSW_API_KEY")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            api_secret: lookup("SERVICE_NSW_API_SECRET")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            incremental_interval: capped_secs(incremental_minutes.saturating_mul(60)),
            full_sync_interval: capped_secs(full_hours.saturating_mul(60 * 60)),
            request_timeout: capped_secs(timeout_secs),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// Upstream client settings, or `None` without credentials.
    pub fn client_config(&self) -> Option<ServiceNswConfig> {
        if !self.has_credentials() {
            return None;
        }
        Some(ServiceNswConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            api_secret: self.api_secret.clone(),
            states: self.states.clone(),
            timeout: self.request_timeout,
        })
    }
}

fn capped_secs(secs: u64) -> Duration {
    Duration::from_secs(secs).min(MAX_CONFIGURED_DURATION)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("service nsw sync is disabled")]
    Disabled,
    #[error("service nsw sync is not configured: missing api key or secret")]
    NotConfigured,
    #[error("invalid sync mode {0:?}: expected \"full\" or \"incremental\"")]
    InvalidMode(String),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Disabled or unconfigured: the operator turned it off, nothing is broken.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Disabled | Self::NotConfigured)
    }
}

/// Parses a manual trigger mode; only `full` and `incremental` are accepted.
pub fn parse_trigger_mode(raw: &str) -> Result<SyncMode, SyncError> {
    let mode = raw.trim();
    if mode.eq_ignore_ascii_case("full") {
        Ok(SyncMode::Full)
    } else if mode.eq_ignore_ascii_case("incremental") {
        Ok(SyncMode::Incremental)
    } else {
        Err(SyncError::InvalidMode(mode.to_string()))
    }
}

/// Orchestrates reference, full and incremental runs against one store.
///
/// Every run, scheduled or manual, executes under `run_lock`, so two runs
/// never interleave writes for the same sync key.
pub struct SyncService {
    store: Arc<dyn SyncStore>,
    feed: Option<Arc<dyn PriceFeed>>,
    config: SyncConfig,
    run_lock: Mutex<()>,
}

impl SyncService {
    pub fn new(
        store: Arc<dyn SyncStore>,
        feed: Option<Arc<dyn PriceFeed>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            feed,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Builds the Service NSW client when credentials are present.
    pub fn from_config(store: Arc<dyn SyncStore>, config: SyncConfig) -> Result<Self, SyncError> {
        let feed = match config.client_config() {
            Some(client) => Some(Arc::new(ServiceNswClient::new(client)?) as Arc<dyn PriceFeed>),
            None => None,
        };
        Ok(Self::new(store, feed, config))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.feed.is_some()
    }

    fn ready_feed(&self) -> Result<Arc<dyn PriceFeed>, SyncError> {
        if !self.config.enabled {
            return Err(SyncError::Disabled);
        }
        self.feed.clone().ok_or(SyncError::NotConfigured)
    }

    pub async fn trigger(&self, mode: SyncMode) -> Result<SyncSummary, SyncError> {
        match mode {
            SyncMode::Full => self.trigger_full_sync().await,
            SyncMode::Incremental => self.trigger_incremental_sync().await,
            SyncMode::Reference => Err(SyncError::InvalidMode(mode.to_string())),
        }
    }

    /// Reference sync followed by a full price sync. The returned summary is
    /// the full run's, carrying the mappings the reference run added.
    pub async fn trigger_full_sync(&self) -> Result<SyncSummary, SyncError> {
        let feed = self.ready_feed()?;
        let _guard = self.run_lock.lock().await;
        self.store.ensure_system_user().await?;
        let reference = self.run(SyncMode::Reference, feed.as_ref()).await?;
        let mut summary = self.run(SyncMode::Full, feed.as_ref()).await?;
        summary.fuel_type_mappings_added = reference.fuel_type_mappings_added;
        Ok(summary)
    }

    pub async fn trigger_incremental_sync(&self) -> Result<SyncSummary, SyncError> {
        let feed = self.ready_feed()?;
        let _guard = self.run_lock.lock().await;
        self.store.ensure_system_user().await?;
        self.run(SyncMode::Incremental, feed.as_ref()).await
    }

    /// Current sync state row; a job that never ran reports all fields empty.
    pub async fn status(&self) -> Result<SyncStateRecord, SyncError> {
        let state = self.store.sync_state(SYNC_KEY).await?;
        Ok(state.unwrap_or_else(|| SyncStateRecord {
            sync_key: SYNC_KEY.to_string(),
            ..SyncStateRecord::default()
        }))
    }

    /// One run of `mode`, with its outcome written to the sync state row.
    /// Callers hold `run_lock`.
    async fn run(&self, mode: SyncMode, feed: &dyn PriceFeed) -> Result<SyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("service_nsw_sync", mode = %mode, run_id = %run_id);
        async move {
            let outcome = match mode {
                SyncMode::Reference => self.reference_sync(feed).await,
                SyncMode::Full | SyncMode::Incremental => self.price_sync(mode, feed).await,
            };
            match outcome {
                Ok(summary) => {
                    self.store.record_success(SYNC_KEY, mode).await?;
                    info!(
                        stations_upserted = summary.stations_upserted,
                        prices_upserted = summary.prices_upserted,
                        submissions_inserted = summary.submissions_inserted,
                        unmapped_fuel_types_skipped = summary.unmapped_fuel_types_skipped,
                        stations_unresolved = summary.stations_unresolved,
                        fuel_type_mappings_added = summary.fuel_type_mappings_added,
                        not_modified = summary.not_modified,
                        "service nsw sync complete"
                    );
                    Ok(summary)
                }
                Err(err) => {
                    if let Err(record_err) = self.store.record_error(SYNC_KEY, &err.to_string()).await
                    {
                        error!(error = %record_err, sync_key = SYNC_KEY, "failed to record sync error");
                    }
                    warn!(error = %err, "service nsw sync failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn reference_sync(&self, feed: &dyn PriceFeed) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::new(SyncMode::Reference);
        let since = self
            .store
            .sync_state(SYNC_KEY)
            .await?
            .and_then(|state| state.last_reference_sync_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let reference = match self
            .with_timeout("reference data request", feed.reference_data(since))
            .await
        {
            Ok(reference) => reference,
            Err(SyncError::Feed(FeedError::NotModified)) => {
                info!("reference data not modified");
                summary.not_modified = true;
                return Ok(summary);
            }
            Err(err) => return Err(err),
        };

        let mut mappings = self.store.fuel_type_mappings().await?;
        for item in &reference.fuel_types.items {
            let code = normalize_fuel_code(&item.code);
            if code.is_empty() || mappings.contains_key(&code) {
                continue;
            }
            let Some(fuel_type_id) = default_fuel_type_id(&code) else {
                debug!(code = %code, state = %item.state, "no fallback fuel type for code");
                continue;
            };
            if self.store.insert_fuel_type_mapping(&code, fuel_type_id).await? {
                summary.fuel_type_mappings_added += 1;
            }
            mappings.insert(code, fuel_type_id);
        }
        Ok(summary)
    }

    async fn price_sync(&self, mode: SyncMode, feed: &dyn PriceFeed) -> Result<SyncSummary, SyncError> {
        let snapshot = match mode {
            SyncMode::Incremental => {
                self.with_timeout("new prices request", feed.new_current_prices())
                    .await?
            }
            _ => {
                self.with_timeout("all prices request", feed.all_current_prices())
                    .await?
            }
        };
        self.persist_prices(mode, &snapshot).await
    }

    async fn with_timeout<T, F>(&self, what: &'static str, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, FeedError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout(what)),
        }
    }

    /// Row-by-row reconciliation. A failed write aborts the run; rows
    /// written before it stay written.
    async fn persist_prices(
        &self,
        mode: SyncMode,
        snapshot: &PriceSnapshot,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::new(mode);
        let user_id = self.store.system_user_id().await?;
        let mappings = self.store.fuel_type_mappings().await?;
        let mut run_stations: BTreeMap<ReconciliationKey, Uuid> = BTreeMap::new();

        for station in &snapshot.stations {
            let Some(upsert) = station.to_upsert() else {
                debug!(state = %station.state, "skipping station without code");
                continue;
            };
            let id = self.store.upsert_station(&upsert).await?;
            run_stations.insert(upsert.key, id);
            summary.stations_upserted += 1;
        }

        for row in &snapshot.prices {
            let fuel_code = normalize_fuel_code(&row.fuel_type);
            let Some(&fuel_type_id) = mappings.get(&fuel_code) else {
                debug!(code = %fuel_code, "skipping price with unmapped fuel type");
                summary.unmapped_fuel_types_skipped += 1;
                continue;
            };
            let Some(key) = ReconciliationKey::new(&row.state, row.station_code.as_str()) else {
                debug!(state = %row.state, "skipping price without station code");
                continue;
            };
            let Some(station_id) = self.resolve_station(&key, &mut run_stations).await? else {
                debug!(station = %key, "skipping price for unknown station");
                summary.stations_unresolved += 1;
                continue;
            };

            let price = normalize_price_cents(row.price.value());
            let observed_at = parse_observed_at(&row.last_updated).unwrap_or_else(|| {
                debug!(value = %row.last_updated, "unparseable lastupdated, using now");
                Utc::now()
            });

            self.store
                .upsert_fuel_price(&FuelPriceUpsert {
                    station_id,
                    fuel_type_id,
                    price,
                    observed_at,
                })
                .await?;
            summary.prices_upserted += 1;

            let submission = PriceSubmission {
                user_id,
                station_id,
                fuel_type_id,
                price,
                submitted_at: observed_at,
                source_hash: source_hash(&key, &fuel_code, fuel_type_id, price, observed_at),
            };
            if self.store.insert_submission_if_new(&submission).await? {
                summary.submissions_inserted += 1;
            }
        }

        Ok(summary)
    }

    /// Run batch first, then (stateless keys only) any run station sharing the
    /// code, then the store. Store hits are remembered for the rest of the run.
    async fn resolve_station(
        &self,
        key: &ReconciliationKey,
        run_stations: &mut BTreeMap<ReconciliationKey, Uuid>,
    ) -> Result<Option<Uuid>, SyncError> {
        if let Some(id) = run_stations.get(key) {
            return Ok(Some(*id));
        }
        if !key.has_state() {
            let same_code = run_stations
                .iter()
                .find(|(candidate, _)| candidate.code() == key.code())
                .map(|(_, id)| *id);
            if same_code.is_some() {
                return Ok(same_code);
            }
        }
        let found = self.store.find_station_id(key).await?;
        if let Some(id) = found {
            run_stations.insert(key.clone(), id);
        }
        Ok(found)
    }
}

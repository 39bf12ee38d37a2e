//! Core domain model and reconciliation helpers for the fuel price sync engine.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fuelsync-core";

/// Name of the single sync job row in `service_nsw_sync_state`.
pub const SYNC_KEY: &str = "service_nsw_v2";

pub const SYSTEM_USER_EMAIL: &str = "service-nsw-sync@gaspeep.local";
pub const SYSTEM_USER_DISPLAY_NAME: &str = "Service NSW Sync";

pub const PRICE_CURRENCY: &str = "AUD";
pub const PRICE_UNIT: &str = "litre";
pub const SUBMISSION_METHOD: &str = "service_nsw_sync";

/// Upstream timestamp layout (`DD/MM/YYYY hh:mm:ss AM/PM`), used for request headers.
pub const FEED_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %I:%M:%S %p";

const OBSERVED_AT_FORMATS: [&str; 2] = ["%d/%m/%Y %H:%M:%S", FEED_TIMESTAMP_FORMAT];

const FALLBACK_FUEL_TYPES: [(&str, u128); 11] = [
    ("E10", 0x550e8400_e29b_41d4_a716_446655440001),
    ("U91", 0x550e8400_e29b_41d4_a716_446655440002),
    ("DL", 0x550e8400_e29b_41d4_a716_446655440003),
    ("PDL", 0x550e8400_e29b_41d4_a716_446655440004),
    ("P95", 0x550e8400_e29b_41d4_a716_446655440005),
    ("P98", 0x550e8400_e29b_41d4_a716_446655440006),
    ("LPG", 0x550e8400_e29b_41d4_a716_446655440007),
    ("ADBLUE", 0x550e8400_e29b_41d4_a716_446655440009),
    ("E85", 0x550e8400_e29b_41d4_a716_446655440010),
    ("B20", 0x550e8400_e29b_41d4_a716_446655440011),
    ("EV", 0x550e8400_e29b_41d4_a716_446655440012),
];

/// Which upstream run is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Reference,
    Full,
    Incremental,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A JSON number that upstream sometimes sends as a string.
///
/// Blank strings and `null` decode to `0.0`; anything else that is not a
/// number or a numeric string is a decode error.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlexFloat(pub f64);

impl FlexFloat {
    pub fn value(self) -> f64 {
        self.0
    }
}

impl From<FlexFloat> for f64 {
    fn from(value: FlexFloat) -> Self {
        value.0
    }
}

impl Serialize for FlexFloat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0)
    }
}

impl<'de> Deserialize<'de> for FlexFloat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlexFloatVisitor;

        impl<'de> Visitor<'de> for FlexFloatVisitor {
            type Value = FlexFloat;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a number or a numeric string")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<FlexFloat, E> {
                Ok(FlexFloat(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<FlexFloat, E> {
                Ok(FlexFloat(v as f64))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FlexFloat, E> {
                Ok(FlexFloat(v as f64))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<FlexFloat, E> {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    return Ok(FlexFloat(0.0));
                }
                trimmed
                    .parse::<f64>()
                    .map(FlexFloat)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }

            fn visit_unit<E: de::Error>(self) -> Result<FlexFloat, E> {
                Ok(FlexFloat(0.0))
            }

            fn visit_none<E: de::Error>(self) -> Result<FlexFloat, E> {
                Ok(FlexFloat(0.0))
            }
        }

        deserializer.deserialize_any(FlexFloatVisitor)
    }
}

/// A JSON string that upstream sometimes sends as a bare number.
///
/// Strings are trimmed, numbers keep their shortest decimal text, `null` is empty.
///
/// Non-integer numbers are rendered from their `f64` value, not their literal
/// text: `1234.50` becomes `"1234.5"` and `1e3` becomes `"1000"`. A code
/// sent that way keys on the normalised text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlexString(pub String);

impl FlexString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FlexString {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

impl fmt::Display for FlexString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for FlexString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FlexString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlexStringVisitor;

        impl<'de> Visitor<'de> for FlexStringVisitor {
            type Value = FlexString;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or a number")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<FlexString, E> {
                Ok(FlexString(v.trim().to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<FlexString, E> {
                Ok(FlexString(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FlexString, E> {
                Ok(FlexString(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<FlexString, E> {
                Ok(FlexString(v.to_string()))
            }

            fn visit_unit<E: de::Error>(self) -> Result<FlexString, E> {
                Ok(FlexString::default())
            }

            fn visit_none<E: de::Error>(self) -> Result<FlexString, E> {
                Ok(FlexString::default())
            }
        }

        deserializer.deserialize_any(FlexStringVisitor)
    }
}

/// Treats an explicit JSON `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedLocation {
    #[serde(default)]
    pub latitude: FlexFloat,
    #[serde(default)]
    pub longitude: FlexFloat,
}

/// Station row as published by the upstream price feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedStation {
    #[serde(rename = "brandid")]
    pub brand_id: FlexString,
    #[serde(rename = "stationid")]
    pub station_id: FlexString,
    pub code: FlexString,
    #[serde(deserialize_with = "null_as_default")]
    pub brand: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub address: String,
    #[serde(deserialize_with = "null_as_default")]
    pub location: FeedLocation,
    #[serde(deserialize_with = "null_as_default")]
    pub state: String,
}

impl FeedStation {
    pub fn reconciliation_key(&self) -> Option<ReconciliationKey> {
        ReconciliationKey::new(&self.state, self.code.as_str())
    }

    /// Normalised store input; `None` when the station has no external code.
    pub fn to_upsert(&self) -> Option<StationUpsert> {
        let key = self.reconciliation_key()?;
        let name = self.name.trim();
        Some(StationUpsert {
            key,
            external_station_id: self.station_id.as_str().trim().to_string(),
            name: if name.is_empty() {
                "Unknown Station".to_string()
            } else {
                name.to_string()
            },
            brand: self.brand.trim().to_string(),
            address: self.address.trim().to_string(),
            latitude: self.location.latitude.value(),
            longitude: self.location.longitude.value(),
        })
    }
}

/// Price row as published by the upstream price feed; `price` is in cents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedPrice {
    #[serde(rename = "stationcode")]
    pub station_code: FlexString,
    #[serde(rename = "fueltype", deserialize_with = "null_as_default")]
    pub fuel_type: String,
    pub price: FlexFloat,
    #[serde(rename = "lastupdated", deserialize_with = "null_as_default")]
    pub last_updated: String,
    #[serde(deserialize_with = "null_as_default")]
    pub state: String,
}

/// Envelope shared by the "all prices" and "new prices" endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceSnapshot {
    #[serde(deserialize_with = "null_as_default")]
    pub stations: Vec<FeedStation>,
    #[serde(deserialize_with = "null_as_default")]
    pub prices: Vec<FeedPrice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceFuelType {
    #[serde(deserialize_with = "null_as_default")]
    pub code: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelTypeList {
    #[serde(deserialize_with = "null_as_default")]
    pub items: Vec<ReferenceFuelType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceData {
    #[serde(rename = "fueltypes", deserialize_with = "null_as_default")]
    pub fuel_types: FuelTypeList,
}

/// `(state, external code)` pair matching an upstream station to an internal row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReconciliationKey {
    state: String,
    code: String,
}

impl ReconciliationKey {
    /// State is upper-cased and trimmed, code trimmed. Blank codes yield `None`.
    pub fn new(state: &str, code: &str) -> Option<Self> {
        let code = code.trim();
        if code.is_empty() {
            return None;
        }
        Some(Self {
            state: state.trim().to_ascii_uppercase(),
            code: code.to_string(),
        })
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn has_state(&self) -> bool {
        !self.state.is_empty()
    }
}

impl fmt::Display for ReconciliationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.state, self.code)
    }
}

/// Mutable descriptive fields written on every station upsert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationUpsert {
    pub key: ReconciliationKey,
    pub external_station_id: String,
    pub name: String,
    pub brand: String,
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuelPriceUpsert {
    pub station_id: Uuid,
    pub fuel_type_id: Uuid,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
}

/// Append-only audit record of one observed upstream price event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceSubmission {
    pub user_id: Uuid,
    pub station_id: Uuid,
    pub fuel_type_id: Uuid,
    pub price: f64,
    pub submitted_at: DateTime<Utc>,
    pub source_hash: String,
}

/// Persisted outcome of the most recent runs of a sync job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateRecord {
    pub sync_key: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_reference_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_incremental_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Observable counters of a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub mode: SyncMode,
    pub stations_upserted: usize,
    pub prices_upserted: usize,
    pub submissions_inserted: usize,
    pub unmapped_fuel_types_skipped: usize,
    pub stations_unresolved: usize,
    pub fuel_type_mappings_added: usize,
    pub not_modified: bool,
}

impl SyncSummary {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            stations_upserted: 0,
            prices_upserted: 0,
            submissions_inserted: 0,
            unmapped_fuel_types_skipped: 0,
            stations_unresolved: 0,
            fuel_type_mappings_added: 0,
            not_modified: false,
        }
    }
}

pub fn normalize_fuel_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Well-known internal fuel type for an upstream code, if any.
pub fn default_fuel_type_id(code: &str) -> Option<Uuid> {
    let code = normalize_fuel_code(code);
    FALLBACK_FUEL_TYPES
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, id)| Uuid::from_u128(*id))
}

/// Converts upstream cents to currency units rounded to three decimals.
pub fn normalize_price_cents(cents: f64) -> f64 {
    ((cents / 100.0) * 1000.0).round() / 1000.0
}

/// Parses an upstream `lastupdated` value; naive layouts are read as UTC.
pub fn parse_observed_at(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for format in OBSERVED_AT_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn format_feed_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(FEED_TIMESTAMP_FORMAT).to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Dedup key for the audit trail: one hash per observed upstream price event.
pub fn source_hash(
    key: &ReconciliationKey,
    fuel_code: &str,
    fuel_type_id: Uuid,
    price: f64,
    observed_at: DateTime<Utc>,
) -> String {
    let input = format!(
        "{}|{}|{}|{}|{:.3}|{}",
        key.state(),
        key.code(),
        fuel_code.trim(),
        fuel_type_id,
        price,
        observed_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    sha256_hex(input.as_bytes())
}

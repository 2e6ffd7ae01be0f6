// 🏠 Data Model - Parcels, owners, vacancy marks
// ParcelRecord is the only persisted shape; owner and vacancy data are
// read-only lookup tables built once per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;

// ============================================================================
// PROVENANCE
// ============================================================================

/// Which input dataset a record or error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Parcel,
    Owner,
    Vacancy,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Parcel => "parcel",
            SourceKind::Owner => "owner",
            SourceKind::Vacancy => "vacancy",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Provenance tag stored with every master record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    County,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::County => "county",
        }
    }
}

// ============================================================================
// PARCEL RECORD
// ============================================================================

/// One master record per APN.
///
/// `apn` has no setter: identity is fixed at construction.
/// Values go through [`ParcelRecord::set_values`] so `total_value`
/// always equals `land_value + improvement_value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    apn: String,

    /// Normalized match key
    #[serde(rename = "property_address")]
    pub address_key: String,

    /// Address as assembled from the source
    #[serde(rename = "property_address_raw")]
    pub street_address: String,

    #[serde(default)]
    pub city: String,

    #[serde(default)]
    pub state: String,

    #[serde(rename = "zip_code", default)]
    pub zip: String,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    #[serde(default)]
    pub land_value: f64,

    #[serde(default)]
    pub improvement_value: f64,

    #[serde(default)]
    pub total_value: f64,

    pub owner_name: Option<String>,
    pub owner_mailing_address: Option<String>,

    #[serde(default)]
    pub is_absentee: bool,

    #[serde(default)]
    pub is_vacant: bool,

    #[serde(default)]
    pub data_source: DataSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sale_date: Option<DateTime<Utc>>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ParcelRecord {
    /// Create a record with default enrichment (no owner, not absentee, not vacant)
    pub fn new(apn: impl Into<String>, street_address: impl Into<String>, now: DateTime<Utc>) -> Self {
        let street_address = street_address.into();
        ParcelRecord {
            apn: apn.into(),
            address_key: crate::normalize::normalize_address(&street_address),
            street_address,
            city: String::new(),
            state: String::new(),
            zip: String::new(),
            latitude: None,
            longitude: None,
            land_value: 0.0,
            improvement_value: 0.0,
            total_value: 0.0,
            owner_name: None,
            owner_mailing_address: None,
            is_absentee: false,
            is_vacant: false,
            data_source: DataSource::County,
            last_sale_date: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apn(&self) -> &str {
        &self.apn
    }

    /// Set land and improvement values; negative or non-finite inputs count as 0
    pub fn set_values(&mut self, land: f64, improvement: f64) {
        self.land_value = non_negative(land);
        self.improvement_value = non_negative(improvement);
        self.total_value = self.land_value + self.improvement_value;
    }

    /// Set values from a source that only reports the assessed total.
    /// The whole amount is carried as improvement value.
    pub fn set_total_only(&mut self, total: f64) {
        self.set_values(0.0, total);
    }

    /// Set coordinates; (0, 0) is the sources' "unknown" and is stored as absent
    pub fn set_coordinates(&mut self, latitude: f64, longitude: f64) {
        if latitude == 0.0 && longitude == 0.0 || !latitude.is_finite() || !longitude.is_finite() {
            self.latitude = None;
            self.longitude = None;
        } else {
            self.latitude = Some(latitude);
            self.longitude = Some(longitude);
        }
    }

    pub fn values_consistent(&self) -> bool {
        (self.total_value - (self.land_value + self.improvement_value)).abs() < 1e-6
            && self.total_value >= 0.0
    }

    /// SHA-256 over the data fields (timestamps excluded).
    /// Two runs over identical input produce identical hashes.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{:?}|{:?}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.apn,
            self.street_address,
            self.city,
            self.state,
            self.zip,
            self.latitude,
            self.longitude,
            self.land_value,
            self.improvement_value,
            self.total_value,
            self.owner_name.as_deref().unwrap_or(""),
            self.owner_mailing_address.as_deref().unwrap_or(""),
            self.is_absentee,
            self.is_vacant,
            self.data_source.as_str(),
        ));
        format!("{:x}", hasher.finalize())
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

// ============================================================================
// LOOKUP TABLES
// ============================================================================

/// Owner-of-record data for one normalized address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub address_key: String,
    pub owner_name: Option<String>,
    pub owner_mailing_address: Option<String>,
    pub is_absentee: bool,
}

/// Owners keyed by normalized address; later inserts replace earlier ones
pub type OwnerIndex = HashMap<String, OwnerRecord>;

/// A single assertion that a parcel is vacant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VacancyMark {
    Apn(String),
    Address(String),
}

/// Vacancy assertions split by key kind. A parcel matching either set is vacant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacancyIndex {
    pub by_apn: HashSet<String>,
    pub by_address: HashSet<String>,
}

impl VacancyIndex {
    pub fn from_marks<I: IntoIterator<Item = VacancyMark>>(marks: I) -> Self {
        let mut index = VacancyIndex::default();
        for mark in marks {
            index.insert(mark);
        }
        index
    }

    pub fn insert(&mut self, mark: VacancyMark) {
        match mark {
            VacancyMark::Apn(apn) => {
                self.by_apn.insert(apn);
            }
            VacancyMark::Address(key) => {
                self.by_address.insert(key);
            }
        }
    }

    /// Logical OR of id match and address match
    pub fn is_vacant(&self, apn: &str, address_key: &str) -> bool {
        self.by_apn.contains(apn) || (!address_key.is_empty() && self.by_address.contains(address_key))
    }

    pub fn is_empty(&self) -> bool {
        self.by_apn.is_empty() && self.by_address.is_empty()
    }
}

// 🔗 Merge Engine - Fold owner and vacancy data into county parcels
//
// The parcel set is authoritative for identity: the output has exactly the
// input's APNs. Owner and vacancy tables only enrich, and a hit assigns all
// of a source's fields at once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::model::{OwnerIndex, ParcelRecord, VacancyIndex};
use crate::normalize::normalize_name;

// ============================================================================
// MERGE STATISTICS
// ============================================================================

/// Match-rate counters for a merge run. Observability only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeStats {
    pub parcels: usize,
    pub owner_matches: usize,
    pub vacant: usize,
    pub absentee: usize,

    /// Distinct owners after legal-suffix normalization
    pub distinct_owners: usize,
}

impl MergeStats {
    pub fn owner_match_rate(&self) -> f64 {
        if self.parcels == 0 {
            0.0
        } else {
            self.owner_matches as f64 / self.parcels as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} parcels, {} matched to owners ({:.1}%), {} vacant, {} absentee, {} distinct owners",
            self.parcels,
            self.owner_matches,
            self.owner_match_rate() * 100.0,
            self.vacant,
            self.absentee,
            self.distinct_owners
        )
    }
}

/// Master record set, ordered by APN, plus the run's statistics
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub records: BTreeMap<String, ParcelRecord>,
    pub stats: MergeStats,
}

impl MergeOutcome {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in emission order
    pub fn iter(&self) -> impl Iterator<Item = &ParcelRecord> {
        self.records.values()
    }
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

pub struct MergeEngine<'a> {
    owners: &'a OwnerIndex,
    vacancy: &'a VacancyIndex,
}

impl<'a> MergeEngine<'a> {
    /// Lookup tables are borrowed for the run and never mutated
    pub fn new(owners: &'a OwnerIndex, vacancy: &'a VacancyIndex) -> Self {
        MergeEngine { owners, vacancy }
    }

    /// Enrich every parcel; consumes the loader output so the engine owns the records
    pub fn merge(&self, parcels: BTreeMap<String, ParcelRecord>) -> MergeOutcome {
        let mut records = parcels;
        let mut stats = MergeStats {
            parcels: records.len(),
            ..MergeStats::default()
        };

        for parcel in records.values_mut() {
            if self.apply_owner(parcel) {
                stats.owner_matches += 1;
            }
            if self.apply_vacancy(parcel) {
                stats.vacant += 1;
            }
            if parcel.is_absentee {
                stats.absentee += 1;
            }
        }

        stats.distinct_owners = records
            .values()
            .filter_map(|p| p.owner_name.as_deref())
            .map(normalize_name)
            .filter(|key| !key.is_empty())
            .collect::<HashSet<_>>()
            .len();

        info!(
            parcels = stats.parcels,
            owner_matches = stats.owner_matches,
            vacant = stats.vacant,
            absentee = stats.absentee,
            "merge complete: {:.1}% owner match rate",
            stats.owner_match_rate() * 100.0
        );

        MergeOutcome { records, stats }
    }

    /// Step 1: owner lookup by normalized address. A hit overwrites all three
    /// owner fields, including with `None`.
    fn apply_owner(&self, parcel: &mut ParcelRecord) -> bool {
        match self.owners.get(&parcel.address_key) {
            Some(owner) => {
                parcel.owner_name = owner.owner_name.clone();
                parcel.owner_mailing_address = owner.owner_mailing_address.clone();
                parcel.is_absentee = owner.is_absentee;
                true
            }
            None => false,
        }
    }

    /// Step 2: vacancy is the OR of the id set and the address set
    fn apply_vacancy(&self, parcel: &mut ParcelRecord) -> bool {
        if self.vacancy.is_vacant(parcel.apn(), &parcel.address_key) {
            parcel.is_vacant = true;
        }
        parcel.is_vacant
    }
}

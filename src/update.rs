// 🔄 Update Detector - Periodic re-run against the stored master set
//
// Classifies each fresh parcel as new, transferred, revalued or with a
// changed vacancy flag. Kinds fire independently for the same parcel.
//
// Owner comparison is an exact, case-sensitive match after trimming, with no
// normalization, unlike the merge step which matches on normalized address.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::Result;
use crate::model::{ParcelRecord, VacancyIndex};
use crate::normalize::normalize_name;
use crate::store::{MasterStore, PropertyEvent};

// ============================================================================
// CHANGE EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    NewProperty {
        apn: String,
        address: String,
        owner: Option<String>,
        detected_at: DateTime<Utc>,
    },
    TitleTransfer {
        apn: String,
        address: String,
        old_owner: Option<String>,
        new_owner: String,
        /// Both names reduce to the same key under suffix normalization.
        /// Informational only; the transfer still fires.
        same_owner_key: bool,
        detected_at: DateTime<Utc>,
    },
    ValueChange {
        apn: String,
        address: String,
        old_value: f64,
        new_value: f64,
        change: f64,
        detected_at: DateTime<Utc>,
    },
    VacancyChange {
        apn: String,
        address: String,
        was_vacant: bool,
        is_vacant: bool,
        detected_at: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn apn(&self) -> &str {
        match self {
            ChangeEvent::NewProperty { apn, .. }
            | ChangeEvent::TitleTransfer { apn, .. }
            | ChangeEvent::ValueChange { apn, .. }
            | ChangeEvent::VacancyChange { apn, .. } => apn,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::NewProperty { .. } => "new_property",
            ChangeEvent::TitleTransfer { .. } => "title_transfer",
            ChangeEvent::ValueChange { .. } => "value_change",
            ChangeEvent::VacancyChange { .. } => "vacancy_change",
        }
    }
}

/// Detection output, grouped by kind, each list ordered by APN
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateReport {
    pub new_properties: Vec<ChangeEvent>,
    pub title_transfers: Vec<ChangeEvent>,
    pub value_changes: Vec<ChangeEvent>,
    pub vacancy_changes: Vec<ChangeEvent>,
}

impl UpdateReport {
    pub fn is_empty(&self) -> bool {
        self.new_properties.is_empty()
            && self.title_transfers.is_empty()
            && self.value_changes.is_empty()
            && self.vacancy_changes.is_empty()
    }

    pub fn total(&self) -> usize {
        self.new_properties.len() + self.title_transfers.len() + self.value_changes.len() + self.vacancy_changes.len()
    }

    /// Persist the run's events as `update_log_YYYYMMDD.json` in `dir`
    pub fn write_log(&self, dir: &Path, run_at: DateTime<Utc>) -> Result<PathBuf> {
        let path = dir.join(format!("update_log_{}.json", run_at.format("%Y%m%d")));
        let mut out = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()?;
        Ok(path)
    }
}

/// What the apply step did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub transfers_applied: usize,
    pub properties_added: usize,
    pub events_recorded: usize,
}

// ============================================================================
// UPDATE DETECTOR
// ============================================================================

pub struct UpdateDetector {
    materiality_threshold: f64,
}

impl UpdateDetector {
    pub fn new(materiality_threshold: f64) -> Self {
        UpdateDetector {
            materiality_threshold,
        }
    }

    /// Compare a fresh parcel snapshot with the stored master set.
    /// Vacancy changes are only evaluated when a vacancy list is supplied.
    pub fn detect(
        &self,
        fresh: &BTreeMap<String, ParcelRecord>,
        stored: &HashMap<String, ParcelRecord>,
        vacancy: Option<&VacancyIndex>,
        detected_at: DateTime<Utc>,
    ) -> UpdateReport {
        let mut report = UpdateReport::default();

        for (apn, parcel) in fresh {
            let Some(existing) = stored.get(apn) else {
                report.new_properties.push(ChangeEvent::NewProperty {
                    apn: apn.clone(),
                    address: parcel.street_address.clone(),
                    owner: parcel.owner_name.clone(),
                    detected_at,
                });
                continue;
            };

            if let Some(event) = self.check_transfer(parcel, existing, detected_at) {
                report.title_transfers.push(event);
            }
            if let Some(event) = self.check_value(parcel, existing, detected_at) {
                report.value_changes.push(event);
            }
            if let Some(vacancy) = vacancy {
                let is_vacant = vacancy.is_vacant(apn, &parcel.address_key);
                if is_vacant != existing.is_vacant {
                    report.vacancy_changes.push(ChangeEvent::VacancyChange {
                        apn: apn.clone(),
                        address: existing.street_address.clone(),
                        was_vacant: existing.is_vacant,
                        is_vacant,
                        detected_at,
                    });
                }
            }
        }

        info!(
            new = report.new_properties.len(),
            transfers = report.title_transfers.len(),
            value_changes = report.value_changes.len(),
            vacancy_changes = report.vacancy_changes.len(),
            "update detection complete"
        );
        report
    }

    fn check_transfer(
        &self,
        parcel: &ParcelRecord,
        existing: &ParcelRecord,
        detected_at: DateTime<Utc>,
    ) -> Option<ChangeEvent> {
        let new_owner = parcel.owner_name.as_deref().map(str::trim).unwrap_or("");
        if new_owner.is_empty() {
            return None;
        }

        // Literal compare: case and whitespace differences count as a transfer
        let old_owner = existing.owner_name.as_deref().map(str::trim);
        if old_owner == Some(new_owner) {
            return None;
        }

        Some(ChangeEvent::TitleTransfer {
            apn: parcel.apn().to_string(),
            address: existing.street_address.clone(),
            old_owner: existing.owner_name.clone(),
            new_owner: new_owner.to_string(),
            same_owner_key: old_owner.map(normalize_name) == Some(normalize_name(new_owner)),
            detected_at,
        })
    }

    fn check_value(
        &self,
        parcel: &ParcelRecord,
        existing: &ParcelRecord,
        detected_at: DateTime<Utc>,
    ) -> Option<ChangeEvent> {
        let new_value = parcel.total_value;
        // A zero reading means "no value in this snapshot", not a drop to zero
        if new_value <= 0.0 {
            return None;
        }

        let change = new_value - existing.total_value;
        if change.abs() <= self.materiality_threshold {
            return None;
        }

        Some(ChangeEvent::ValueChange {
            apn: parcel.apn().to_string(),
            address: existing.street_address.clone(),
            old_value: existing.total_value,
            new_value,
            change,
            detected_at,
        })
    }

    /// Apply detected changes: every title transfer first, then every new property.
    /// Value and vacancy changes are report-only.
    pub fn apply<S: MasterStore>(
        &self,
        store: &mut S,
        report: &UpdateReport,
        fresh: &BTreeMap<String, ParcelRecord>,
        applied_at: DateTime<Utc>,
    ) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        for event in &report.title_transfers {
            if let ChangeEvent::TitleTransfer {
                apn,
                old_owner,
                new_owner,
                ..
            } = event
            {
                store.apply_title_transfer(apn, new_owner, applied_at)?;
                summary.transfers_applied += 1;

                let details = format!(
                    "Owner changed from {} to {}",
                    old_owner.as_deref().unwrap_or("(none)"),
                    new_owner
                );
                store.record_event(&PropertyEvent::new(
                    event.kind(),
                    apn,
                    details,
                    serde_json::to_value(event)?,
                    applied_at,
                ))?;
                summary.events_recorded += 1;
            }
        }

        for event in &report.new_properties {
            let Some(parcel) = fresh.get(event.apn()) else {
                warn!(apn = event.apn(), "new property missing from fresh snapshot, skipped");
                continue;
            };

            let mut minimal = ParcelRecord::new(parcel.apn(), parcel.street_address.clone(), applied_at);
            minimal.city = parcel.city.clone();
            minimal.state = parcel.state.clone();
            minimal.owner_name = parcel.owner_name.clone();
            store.insert_new_property(&minimal)?;
            summary.properties_added += 1;
        }

        info!(
            transfers = summary.transfers_applied,
            added = summary.properties_added,
            "updates applied"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VacancyMark;
    use crate::store::SqliteStore;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn parcel(apn: &str, owner: Option<&str>, total: f64) -> ParcelRecord {
        let mut p = ParcelRecord::new(apn, "1 Elm Street", ts());
        p.owner_name = owner.map(str::to_string);
        p.set_values(total, 0.0);
        p
    }

    fn fresh(rows: Vec<ParcelRecord>) -> BTreeMap<String, ParcelRecord> {
        rows.into_iter().map(|p| (p.apn().to_string(), p)).collect()
    }

    fn stored(rows: Vec<ParcelRecord>) -> HashMap<String, ParcelRecord> {
        rows.into_iter().map(|p| (p.apn().to_string(), p)).collect()
    }

    fn detector() -> UpdateDetector {
        UpdateDetector::new(1000.0)
    }

    #[test]
    fn test_value_change_below_threshold_ignored() {
        let report = detector().detect(
            &fresh(vec![parcel("A", None, 500_500.0)]),
            &stored(vec![parcel("A", None, 500_000.0)]),
            None,
            ts(),
        );
        assert!(report.value_changes.is_empty());
        assert!(report.is_empty());
    }

    #[test]
    fn test_value_change_above_threshold() {
        let report = detector().detect(
            &fresh(vec![parcel("A", None, 502_000.0)]),
            &stored(vec![parcel("A", None, 500_000.0)]),
            None,
            ts(),
        );

        assert_eq!(report.value_changes.len(), 1);
        match &report.value_changes[0] {
            ChangeEvent::ValueChange { change, old_value, new_value, .. } => {
                assert_eq!(*change, 2000.0);
                assert_eq!(*old_value, 500_000.0);
                assert_eq!(*new_value, 502_000.0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_exactly_threshold_is_not_material() {
        let report = detector().detect(
            &fresh(vec![parcel("A", None, 501_000.0)]),
            &stored(vec![parcel("A", None, 500_000.0)]),
            None,
            ts(),
        );
        assert!(report.value_changes.is_empty());
    }

    #[test]
    fn test_zero_reading_is_not_a_value_change() {
        let report = detector().detect(
            &fresh(vec![parcel("A", None, 0.0)]),
            &stored(vec![parcel("A", None, 500_000.0)]),
            None,
            ts(),
        );
        assert!(report.value_changes.is_empty());
    }

    #[test]
    fn test_new_property() {
        let report = detector().detect(&fresh(vec![parcel("NEW", Some("X"), 1.0)]), &stored(vec![]), None, ts());

        assert_eq!(report.new_properties.len(), 1);
        assert_eq!(report.new_properties[0].apn(), "NEW");
        assert_eq!(report.new_properties[0].kind(), "new_property");
    }

    #[test]
    fn test_title_transfer_exact_compare() {
        let report = detector().detect(
            &fresh(vec![
                parcel("SAME", Some("  JANE DOE  "), 1.0),
                parcel("NEW-OWNER", Some("BOB LEE"), 1.0),
                parcel("BLANK", Some("   "), 1.0),
                parcel("WAS-NONE", Some("ANN"), 1.0),
            ]),
            &stored(vec![
                parcel("SAME", Some("JANE DOE"), 1.0),
                parcel("NEW-OWNER", Some("JANE DOE"), 1.0),
                parcel("BLANK", Some("JANE DOE"), 1.0),
                parcel("WAS-NONE", None, 1.0),
            ]),
            None,
            ts(),
        );

        let apns: Vec<&str> = report.title_transfers.iter().map(|e| e.apn()).collect();
        assert_eq!(apns, vec!["NEW-OWNER", "WAS-NONE"]);
    }

    #[test]
    fn test_owner_compare_is_not_normalized() {
        // Merge matches on normalized keys, transfer detection does not.
        // Case or suffix noise still raises a transfer, flagged by same_owner_key.
        let report = detector().detect(
            &fresh(vec![parcel("A", Some("Jane Doe Trust"), 1.0)]),
            &stored(vec![parcel("A", Some("JANE DOE"), 1.0)]),
            None,
            ts(),
        );

        assert_eq!(report.title_transfers.len(), 1);
        match &report.title_transfers[0] {
            ChangeEvent::TitleTransfer { same_owner_key, new_owner, .. } => {
                assert!(*same_owner_key);
                assert_eq!(new_owner, "Jane Doe Trust");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_kinds_fire_independently() {
        let report = detector().detect(
            &fresh(vec![parcel("A", Some("BOB"), 600_000.0)]),
            &stored(vec![parcel("A", Some("ANN"), 500_000.0)]),
            None,
            ts(),
        );

        assert_eq!(report.title_transfers.len(), 1);
        assert_eq!(report.value_changes.len(), 1);
        assert_eq!(report.total(), 2);
    }

    #[test]
    fn test_vacancy_change_only_with_vacancy_list() {
        let mut was_vacant = parcel("A", None, 1.0);
        was_vacant.is_vacant = true;
        let fresh_set = fresh(vec![parcel("A", None, 1.0), parcel("B", None, 1.0)]);
        let stored_set = stored(vec![was_vacant, parcel("B", None, 1.0)]);

        let without = detector().detect(&fresh_set, &stored_set, None, ts());
        assert!(without.vacancy_changes.is_empty());

        let vacancy = VacancyIndex::from_marks(vec![VacancyMark::Apn("B".to_string())]);
        let with = detector().detect(&fresh_set, &stored_set, Some(&vacancy), ts());
        let apns: Vec<&str> = with.vacancy_changes.iter().map(|e| e.apn()).collect();
        assert_eq!(apns, vec!["A", "B"]);
    }

    #[test]
    fn test_apply_updates_store_and_audit_log() {
        let mut store = SqliteStore::open_in_memory("master_properties").unwrap();
        store
            .upsert_batch(&[parcel("A", Some("ANN"), 500_000.0)])
            .unwrap();

        let fresh_set = fresh(vec![
            parcel("A", Some("BOB"), 600_000.0),
            parcel("N", Some("NEWBIE"), 10.0),
        ]);
        let stored_set: HashMap<String, ParcelRecord> = store
            .fetch_all()
            .unwrap()
            .into_iter()
            .map(|p| (p.apn().to_string(), p))
            .collect();

        let det = detector();
        let report = det.detect(&fresh_set, &stored_set, None, ts());
        let summary = det.apply(&mut store, &report, &fresh_set, ts()).unwrap();

        assert_eq!(summary.transfers_applied, 1);
        assert_eq!(summary.properties_added, 1);
        assert_eq!(summary.events_recorded, 1);

        let a = store.get("A").unwrap().unwrap();
        assert_eq!(a.owner_name.as_deref(), Some("BOB"));
        assert_eq!(a.last_sale_date, Some(ts()));
        assert_eq!(a.total_value, 500_000.0, "value changes are report-only");

        let events = store.events_for("A").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].details, "Owner changed from ANN to BOB");

        let n = store.get("N").unwrap().unwrap();
        assert_eq!(n.owner_name.as_deref(), Some("NEWBIE"));
        assert_eq!(n.total_value, 0.0);
    }

    #[test]
    fn test_rerun_after_apply_detects_nothing_new() {
        let mut store = SqliteStore::open_in_memory("master_properties").unwrap();
        store.upsert_batch(&[parcel("A", Some("ANN"), 1.0)]).unwrap();
        let fresh_set = fresh(vec![parcel("A", Some("BOB"), 1.0), parcel("N", None, 1.0)]);

        let det = detector();
        for _ in 0..2 {
            let stored_set: HashMap<String, ParcelRecord> = store
                .fetch_all()
                .unwrap()
                .into_iter()
                .map(|p| (p.apn().to_string(), p))
                .collect();
            let report = det.detect(&fresh_set, &stored_set, None, ts());
            det.apply(&mut store, &report, &fresh_set, ts()).unwrap();
        }

        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.event_count().unwrap(), 1, "second run finds no transfer");
    }

    #[test]
    fn test_value_change_from_total_value_extract() {
        use crate::config::PipelineConfig;
        use crate::loaders::{ParcelLoader, SourceLoader};
        use std::io::Cursor;

        let input = "APN,SitusCity,SitusAddress,OwnerName,TotalValue\nA,HAYWARD,1 Elm Street,ANN,502000\n";
        let fresh_set = ParcelLoader::new(&PipelineConfig::default(), ts())
            .load_reader(Cursor::new(input))
            .unwrap()
            .records;

        let report = detector().detect(&fresh_set, &stored(vec![parcel("A", Some("ANN"), 500_000.0)]), None, ts());

        assert_eq!(report.value_changes.len(), 1);
        assert!(report.title_transfers.is_empty());
        match &report.value_changes[0] {
            ChangeEvent::ValueChange { change, .. } => assert_eq!(*change, 2000.0),
            other => panic!("unexpected event {:?}", other),
        }
    }

    /// Records the order of store calls
    struct RecordingStore {
        inner: SqliteStore,
        calls: Vec<String>,
    }

    impl MasterStore for RecordingStore {
        fn upsert_batch(&mut self, records: &[ParcelRecord]) -> Result<usize> {
            self.inner.upsert_batch(records)
        }
        fn count_by_keys(&self, apns: &[String]) -> Result<usize> {
            self.inner.count_by_keys(apns)
        }
        fn count(&self) -> Result<usize> {
            self.inner.count()
        }
        fn fetch_all(&self) -> Result<Vec<ParcelRecord>> {
            self.inner.fetch_all()
        }
        fn apply_title_transfer(&mut self, apn: &str, owner: &str, at: DateTime<Utc>) -> Result<()> {
            self.calls.push(format!("transfer:{}", apn));
            self.inner.apply_title_transfer(apn, owner, at)
        }
        fn insert_new_property(&mut self, record: &ParcelRecord) -> Result<()> {
            self.calls.push(format!("insert:{}", record.apn()));
            self.inner.insert_new_property(record)
        }
        fn record_event(&mut self, event: &PropertyEvent) -> Result<()> {
            self.calls.push(format!("event:{}", event.apn));
            self.inner.record_event(event)
        }
    }

    #[test]
    fn test_apply_runs_all_transfers_before_inserts() {
        let mut store = RecordingStore {
            inner: SqliteStore::open_in_memory("master_properties").unwrap(),
            calls: Vec::new(),
        };
        store
            .upsert_batch(&[parcel("B", Some("ANN"), 1.0), parcel("D", Some("CAL"), 1.0)])
            .unwrap();

        // APN order interleaves new and transferred parcels
        let fresh_set = fresh(vec![
            parcel("A", None, 1.0),
            parcel("B", Some("BOB"), 1.0),
            parcel("C", None, 1.0),
            parcel("D", Some("DAN"), 1.0),
        ]);
        let stored_set: HashMap<String, ParcelRecord> = store
            .fetch_all()
            .unwrap()
            .into_iter()
            .map(|p| (p.apn().to_string(), p))
            .collect();

        let det = detector();
        let report = det.detect(&fresh_set, &stored_set, None, ts());
        det.apply(&mut store, &report, &fresh_set, ts()).unwrap();

        assert_eq!(
            store.calls,
            vec![
                "transfer:B",
                "event:B",
                "transfer:D",
                "event:D",
                "insert:A",
                "insert:C",
            ]
        );
    }

    #[test]
    fn test_write_log() {
        let dir = tempfile::tempdir().unwrap();
        let report = detector().detect(&fresh(vec![parcel("NEW", None, 1.0)]), &stored(vec![]), None, ts());

        let path = report.write_log(dir.path(), ts()).unwrap();
        assert!(path.ends_with("update_log_20250601.json"));

        let back: UpdateReport = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["new_properties"][0]["kind"], "new_property");
    }
}

// 🚚 Bulk Loader - Sequential idempotent batches into a MasterStore
//
// Each batch is keyed by its own APNs, so re-sending after a partial failure
// is safe. A failed batch is split in half until single records remain;
// whatever still fails is collected for out-of-band retry. One bad record
// never fails the run.

use serde::Serialize;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::LoadConfig;
use crate::error::Result;
use crate::model::ParcelRecord;
use crate::store::MasterStore;

/// Outcome of one bulk load
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub total: usize,
    pub loaded: usize,
    pub batches: usize,
    pub retried_batches: usize,
    pub failed_apns: Vec<String>,
}

impl LoadReport {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.loaded as f64 / self.total as f64
        }
    }
}

/// Post-load comparison of expected keys against the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub expected: usize,
    pub found: usize,
    pub store_total: usize,
}

impl VerificationReport {
    pub fn is_match(&self) -> bool {
        self.expected == self.found
    }

    pub fn missing(&self) -> usize {
        self.expected.saturating_sub(self.found)
    }
}

pub struct BulkLoader {
    batch_size: usize,
    delay: Duration,
}

impl BulkLoader {
    pub fn new(config: &LoadConfig) -> Self {
        BulkLoader {
            batch_size: config.batch_size.max(1),
            delay: Duration::from_millis(config.batch_delay_ms),
        }
    }

    /// Upsert all records in fixed-size batches with a pause between them
    pub fn load<S: MasterStore>(&self, store: &mut S, records: &[ParcelRecord]) -> LoadReport {
        let mut report = LoadReport {
            total: records.len(),
            ..LoadReport::default()
        };
        let total_batches = records.len().div_ceil(self.batch_size);

        for (i, batch) in records.chunks(self.batch_size).enumerate() {
            report.batches += 1;

            match store.upsert_batch(batch) {
                Ok(_) => report.loaded += batch.len(),
                Err(err) => {
                    report.retried_batches += 1;
                    warn!(
                        batch = i + 1,
                        of = total_batches,
                        error = %err,
                        "batch failed, retrying at finer granularity"
                    );
                    self.retry_split(store, batch, &mut report);
                }
            }

            info!(
                batch = i + 1,
                of = total_batches,
                loaded = report.loaded,
                total = report.total,
                "batch done"
            );

            if i + 1 < total_batches && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }

        if !report.failed_apns.is_empty() {
            warn!(failed = report.failed_apns.len(), "records left for out-of-band retry");
        }
        report
    }

    fn retry_split<S: MasterStore>(&self, store: &mut S, batch: &[ParcelRecord], report: &mut LoadReport) {
        if batch.len() <= 1 {
            if let Some(record) = batch.first() {
                match store.upsert_batch(batch) {
                    Ok(_) => report.loaded += 1,
                    Err(err) => {
                        warn!(apn = record.apn(), error = %err, "record rejected");
                        report.failed_apns.push(record.apn().to_string());
                    }
                }
            }
            return;
        }

        let (left, right) = batch.split_at(batch.len() / 2);
        for half in [left, right] {
            match store.upsert_batch(half) {
                Ok(_) => report.loaded += half.len(),
                Err(_) if half.len() > 1 => self.retry_split(store, half, report),
                Err(err) => {
                    let apn = half[0].apn();
                    warn!(apn, error = %err, "record rejected");
                    report.failed_apns.push(apn.to_string());
                }
            }
        }
    }

    /// Count the loaded keys back out of the store. A mismatch is reported, not fixed.
    pub fn verify<S: MasterStore>(&self, store: &S, records: &[ParcelRecord]) -> Result<VerificationReport> {
        let keys: Vec<String> = records.iter().map(|r| r.apn().to_string()).collect();
        let report = VerificationReport {
            expected: keys.len(),
            found: store.count_by_keys(&keys)?,
            store_total: store.count()?,
        };

        if report.is_match() {
            info!(found = report.found, "verification passed");
        } else {
            warn!(
                expected = report.expected,
                found = report.found,
                "verification mismatch"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::store::{PropertyEvent, SqliteStore};
    use chrono::{DateTime, Utc};

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-15T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn records(n: usize) -> Vec<ParcelRecord> {
        (0..n)
            .map(|i| {
                let mut r = ParcelRecord::new(format!("APN-{:03}", i), format!("{} Elm Street", i), ts());
                r.set_values(1000.0, i as f64);
                r
            })
            .collect()
    }

    fn loader(batch_size: usize) -> BulkLoader {
        BulkLoader::new(&LoadConfig {
            batch_size,
            batch_delay_ms: 0,
        })
    }

    /// Rejects any batch containing a poisoned APN
    struct FlakyStore {
        inner: SqliteStore,
        poisoned: Vec<String>,
        calls: usize,
    }

    impl MasterStore for FlakyStore {
        fn upsert_batch(&mut self, records: &[ParcelRecord]) -> crate::error::Result<usize> {
            self.calls += 1;
            if records.iter().any(|r| self.poisoned.iter().any(|p| p == r.apn())) {
                return Err(PipelineError::Config("rejected by store".to_string()));
            }
            self.inner.upsert_batch(records)
        }
        fn count_by_keys(&self, apns: &[String]) -> crate::error::Result<usize> {
            self.inner.count_by_keys(apns)
        }
        fn count(&self) -> crate::error::Result<usize> {
            self.inner.count()
        }
        fn fetch_all(&self) -> crate::error::Result<Vec<ParcelRecord>> {
            self.inner.fetch_all()
        }
        fn apply_title_transfer(&mut self, apn: &str, owner: &str, at: DateTime<Utc>) -> crate::error::Result<()> {
            self.inner.apply_title_transfer(apn, owner, at)
        }
        fn insert_new_property(&mut self, record: &ParcelRecord) -> crate::error::Result<()> {
            self.inner.insert_new_property(record)
        }
        fn record_event(&mut self, event: &PropertyEvent) -> crate::error::Result<()> {
            self.inner.record_event(event)
        }
    }

    fn flaky(poisoned: &[&str]) -> FlakyStore {
        FlakyStore {
            inner: SqliteStore::open_in_memory("master_properties").unwrap(),
            poisoned: poisoned.iter().map(|s| s.to_string()).collect(),
            calls: 0,
        }
    }

    #[test]
    fn test_loads_all_batches() {
        let mut store = SqliteStore::open_in_memory("master_properties").unwrap();
        let data = records(25);

        let report = loader(10).load(&mut store, &data);

        assert_eq!(report.batches, 3);
        assert_eq!(report.loaded, 25);
        assert!(report.failed_apns.is_empty());
        assert_eq!(store.count().unwrap(), 25);
    }

    #[test]
    fn test_failed_batch_isolates_bad_record() {
        let mut store = flaky(&["APN-013"]);
        let data = records(25);

        let report = loader(10).load(&mut store, &data);

        assert_eq!(report.retried_batches, 1);
        assert_eq!(report.loaded, 24);
        assert_eq!(report.failed_apns, vec!["APN-013".to_string()]);
        assert_eq!(store.count().unwrap(), 24);
    }

    #[test]
    fn test_multiple_bad_records_do_not_abort_run() {
        let mut store = flaky(&["APN-000", "APN-007", "APN-024"]);
        let data = records(25);

        let report = loader(8).load(&mut store, &data);

        assert_eq!(report.loaded, 22);
        assert_eq!(report.failed_apns.len(), 3);
        assert_eq!(report.loaded + report.failed_apns.len(), report.total);
        assert!(store.calls > report.batches, "failed batches were retried");
    }

    #[test]
    fn test_replay_after_partial_failure_is_safe() {
        let mut store = flaky(&["APN-004"]);
        let data = records(10);
        loader(5).load(&mut store, &data);

        // Store recovers; the whole load is replayed
        store.poisoned.clear();
        let report = loader(5).load(&mut store, &data);

        assert!(report.failed_apns.is_empty());
        assert_eq!(store.count().unwrap(), 10);
    }

    #[test]
    fn test_verify_reports_mismatch() {
        let mut store = flaky(&["APN-002"]);
        let data = records(5);
        let bulk = loader(5);
        bulk.load(&mut store, &data);

        let verification = bulk.verify(&store, &data).unwrap();
        assert!(!verification.is_match());
        assert_eq!(verification.expected, 5);
        assert_eq!(verification.found, 4);
        assert_eq!(verification.missing(), 1);
    }

    #[test]
    fn test_empty_load() {
        let mut store = SqliteStore::open_in_memory("master_properties").unwrap();
        let report = loader(10).load(&mut store, &[]);

        assert_eq!(report.batches, 0);
        assert_eq!(report.success_rate(), 1.0);
    }
}

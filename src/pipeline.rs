// 🧩 Pipeline - load → merge → emit
//
// One run reads the three sources, merges them into the master set and writes
// the SQL upsert artifact plus the JSON backup. Output depends only on the
// inputs and the configuration; the run timestamp touches only
// created_at/updated_at, which the content hash ignores.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::emit::{BackupSnapshot, SqlEmitter};
use crate::error::{PipelineError, Result};
use crate::loaders::{LoadStats, Loaded, OwnerLoader, ParcelLoader, SourceLoader, VacancyLoader};
use crate::merge::{MergeEngine, MergeOutcome};
use crate::model::{OwnerIndex, ParcelRecord, SourceKind, VacancyIndex};

/// Input files for one run
#[derive(Debug, Clone)]
pub struct SourcePaths {
    pub parcels: PathBuf,
    pub owners: PathBuf,
    pub vacancy: PathBuf,
}

/// Per-source load counters for the run summary
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStats {
    pub parcel: LoadStats,
    pub owner: LoadStats,
    pub vacancy: LoadStats,
}

/// A merged master set ready to emit
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub outcome: MergeOutcome,
    pub sources: SourceStats,
    pub generated_at: DateTime<Utc>,
}

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Pipeline { config }
    }

    /// Load and merge from files. Any missing source file is fatal.
    pub fn run(&self, paths: &SourcePaths, now: DateTime<Utc>) -> Result<PipelineRun> {
        info!(parcels = %paths.parcels.display(), "loading parcel source");
        let parcels = ParcelLoader::new(self.config, now).load(&paths.parcels)?;
        let owners = OwnerLoader::new(self.config).load(&paths.owners)?;
        let vacancy = VacancyLoader::new(self.config).load(&paths.vacancy)?;

        self.assemble(parcels, owners, vacancy, now)
    }

    /// Same as [`Pipeline::run`] over in-memory readers
    pub fn run_readers<P: Read, O: Read, V: Read>(
        &self,
        parcels: P,
        owners: O,
        vacancy: V,
        now: DateTime<Utc>,
    ) -> Result<PipelineRun> {
        let parcels = ParcelLoader::new(self.config, now).load_reader(parcels)?;
        let owners = OwnerLoader::new(self.config).load_reader(owners)?;
        let vacancy = VacancyLoader::new(self.config).load_reader(vacancy)?;

        self.assemble(parcels, owners, vacancy, now)
    }

    fn assemble(
        &self,
        parcels: Loaded<BTreeMap<String, ParcelRecord>>,
        owners: Loaded<OwnerIndex>,
        vacancy: Loaded<VacancyIndex>,
        now: DateTime<Utc>,
    ) -> Result<PipelineRun> {
        if parcels.records.is_empty() {
            return Err(PipelineError::EmptyDataset(SourceKind::Parcel));
        }
        if owners.records.is_empty() {
            warn!(source = %SourceKind::Owner, "no owner records; every parcel keeps default owner fields");
        }
        if vacancy.records.is_empty() {
            warn!(source = %SourceKind::Vacancy, "no vacancy marks; no parcel will be flagged vacant");
        }

        let outcome = MergeEngine::new(&owners.records, &vacancy.records).merge(parcels.records);
        info!("{}", outcome.stats.summary());

        Ok(PipelineRun {
            outcome,
            sources: SourceStats {
                parcel: parcels.stats,
                owner: owners.stats,
                vacancy: vacancy.stats,
            },
            generated_at: now,
        })
    }

    /// Write the SQL upsert artifact and the JSON backup for a run
    pub fn emit(&self, run: &PipelineRun, sql_out: &Path, json_out: &Path) -> Result<usize> {
        let written = SqlEmitter::new(self.config.table.clone()).write_file(
            sql_out,
            run.outcome.iter(),
            run.generated_at,
        )?;
        BackupSnapshot::new(run.outcome.iter(), run.generated_at).write_file(json_out)?;
        Ok(written)
    }
}

// ⚙️ Pipeline Configuration
// Optional TOML file; every key has a default so a run works without one.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target municipality, matched as a case-insensitive substring of the city field
    pub municipality: String,

    /// State written into every master record
    pub state: String,

    /// Table the SQL artifact and the store write to
    pub table: String,

    pub vacancy: VacancyConfig,
    pub load: LoadConfig,
    pub update: UpdateConfig,
    pub split: SplitConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VacancyConfig {
    /// Literal token a line must contain to qualify (city and state columns)
    pub match_token: String,

    /// Leading lines to skip before data rows start
    pub header_lines: usize,

    pub apn_column: usize,
    pub address_column: usize,

    /// A qualifying line needs strictly more fields than this
    pub min_columns: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub batch_size: usize,

    /// Pause between batches, for the store's rate limits
    pub batch_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Minimum absolute change in total value that counts as a value change
    pub materiality_threshold: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SplitConfig {
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            municipality: "HAYWARD".to_string(),
            state: "CA".to_string(),
            table: "master_properties".to_string(),
            vacancy: VacancyConfig::default(),
            load: LoadConfig::default(),
            update: UpdateConfig::default(),
            split: SplitConfig::default(),
        }
    }
}

impl Default for VacancyConfig {
    fn default() -> Self {
        VacancyConfig {
            match_token: "Hayward,CA".to_string(),
            header_lines: 2,
            apn_column: 0,
            address_column: 4,
            min_columns: 5,
        }
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        LoadConfig {
            batch_size: 100,
            batch_delay_ms: 100,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        UpdateConfig {
            materiality_threshold: 1000.0,
        }
    }
}

impl Default for SplitConfig {
    fn default() -> Self {
        SplitConfig { chunk_size: 5000 }
    }
}

impl PipelineConfig {
    /// Load from a TOML file, or fall back to defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    PipelineError::Config(format!(
                        "Failed to read config file '{}': {}",
                        path.display(),
                        e
                    ))
                })?;
                toml::from_str(&content)?
            }
            None => PipelineConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.municipality.trim().is_empty() {
            return Err(PipelineError::Config("municipality must not be empty".into()));
        }
        if self.table.is_empty() || !self.table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(PipelineError::Config(format!(
                "table name '{}' must be a plain SQL identifier",
                self.table
            )));
        }
        if self.load.batch_size == 0 {
            return Err(PipelineError::Config("load.batch_size must be at least 1".into()));
        }
        if self.split.chunk_size == 0 {
            return Err(PipelineError::Config("split.chunk_size must be at least 1".into()));
        }
        if self.vacancy.apn_column > self.vacancy.min_columns
            || self.vacancy.address_column > self.vacancy.min_columns
        {
            return Err(PipelineError::Config(
                "vacancy columns must fall inside vacancy.min_columns".into(),
            ));
        }
        if !(self.update.materiality_threshold >= 0.0) {
            return Err(PipelineError::Config(
                "update.materiality_threshold must be non-negative".into(),
            ));
        }
        Ok(())
    }
}

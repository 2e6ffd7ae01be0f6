// ⚠️ Pipeline Errors
// Fatal conditions only. Skippable row problems are counted in LoadStats,
// failed batches land in LoadReport, never here.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::SourceKind;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{kind} source unavailable at {}: {source}", path.display())]
    SourceUnavailable {
        kind: SourceKind,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} source produced no usable records")]
    EmptyDataset(SourceKind),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed SQL artifact: {0}")]
    MalformedArtifact(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// Parcel Master - Core Library
// Record linkage for county parcel, owner and vacancy data

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod loaders;
pub mod merge;
pub mod emit;
pub mod store;
pub mod bulk;
pub mod update;
pub mod split;
pub mod pipeline;

// Re-export commonly used types
pub use config::{LoadConfig, PipelineConfig, SplitConfig, UpdateConfig, VacancyConfig};
pub use error::{PipelineError, Result};
pub use model::{
    DataSource, OwnerIndex, OwnerRecord, ParcelRecord, SourceKind, VacancyIndex, VacancyMark,
};
pub use normalize::{normalize_address, normalize_name};
pub use loaders::{LoadStats, Loaded, OwnerLoader, ParcelLoader, SourceLoader, VacancyLoader};
pub use merge::{MergeEngine, MergeOutcome, MergeStats};
pub use emit::{BackupSnapshot, SqlDialect, SqlEmitter};
pub use store::{MasterStore, PropertyEvent, SqliteStore};
pub use bulk::{BulkLoader, LoadReport, VerificationReport};
pub use update::{ApplySummary, ChangeEvent, UpdateDetector, UpdateReport};
pub use split::{SqlArtifact, SqlSplitter};
pub use pipeline::{Pipeline, PipelineRun, SourcePaths, SourceStats};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

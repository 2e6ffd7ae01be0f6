use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use parcel_master::{
    logging, BackupSnapshot, BulkLoader, MasterStore, ParcelLoader, ParcelRecord, Pipeline,
    PipelineConfig, PipelineError, SourceKind, SourceLoader, SourcePaths, SqlSplitter,
    SqliteStore, UpdateDetector, VacancyLoader,
};

#[derive(Parser)]
#[command(name = "parcel-master")]
#[command(about = "County parcel record linkage: merge, import, monthly update, split")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge parcel, owner and vacancy files into the master set
    Merge {
        #[arg(long)]
        parcels: PathBuf,
        #[arg(long)]
        owners: PathBuf,
        #[arg(long)]
        vacancy: PathBuf,
        #[arg(long, default_value = "import_properties.sql")]
        sql_out: PathBuf,
        #[arg(long, default_value = "master_properties_backup.json")]
        json_out: PathBuf,
    },
    /// Bulk-load a JSON backup snapshot into the master store
    Import {
        #[arg(long, default_value = "master_properties_backup.json")]
        snapshot: PathBuf,
        #[arg(long, default_value = "master_properties.db")]
        db: PathBuf,
        /// Where APNs that could not be loaded are written
        #[arg(long, default_value = "failed_apns.txt")]
        failed_out: PathBuf,
    },
    /// Detect and apply changes from a fresh parcel file
    Update {
        #[arg(long)]
        parcels: PathBuf,
        #[arg(long, default_value = "master_properties.db")]
        db: PathBuf,
        /// Vacancy list; vacancy changes are only checked when given
        #[arg(long)]
        vacancy: Option<PathBuf>,
        /// Report changes without touching the store
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,
    },
    /// Split a SQL upsert artifact into smaller runnable files
    Split {
        #[arg(long, default_value = "import_properties.sql")]
        input: PathBuf,
        /// Records per chunk (overrides the config file)
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Merge {
            parcels,
            owners,
            vacancy,
            sql_out,
            json_out,
        } => run_merge(&config, SourcePaths { parcels, owners, vacancy }, &sql_out, &json_out),
        Commands::Import {
            snapshot,
            db,
            failed_out,
        } => run_import(&config, &snapshot, &db, &failed_out),
        Commands::Update {
            parcels,
            db,
            vacancy,
            dry_run,
            log_dir,
        } => run_update(&config, &parcels, &db, vacancy.as_deref(), dry_run, &log_dir),
        Commands::Split {
            input,
            chunk_size,
            out_dir,
        } => run_split(&config, &input, chunk_size, &out_dir),
    }
}

fn run_merge(config: &PipelineConfig, paths: SourcePaths, sql_out: &Path, json_out: &Path) -> Result<()> {
    println!("🏗️  Parcel Master: merge {} sources", config.municipality);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let pipeline = Pipeline::new(config);

    println!("\n📂 Loading sources...");
    let run = pipeline.run(&paths, Utc::now()).context("Merge failed")?;
    println!("✓ Parcels kept: {}", run.sources.parcel.kept);
    println!("✓ Owner records: {}", run.sources.owner.kept);
    println!("✓ Vacancy lines: {}", run.sources.vacancy.kept);

    println!("\n🔗 Merge");
    println!("✓ {}", run.outcome.stats.summary());

    println!("\n📤 Writing artifacts...");
    let written = pipeline
        .emit(&run, sql_out, json_out)
        .context("Failed to write output artifacts")?;
    println!("✓ SQL upsert: {} ({} properties)", sql_out.display(), written);
    println!("✓ JSON backup: {}", json_out.display());

    Ok(())
}

fn run_import(config: &PipelineConfig, snapshot: &Path, db: &Path, failed_out: &Path) -> Result<()> {
    println!("🗄️  Parcel Master: bulk import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let snapshot = BackupSnapshot::read_file(snapshot)
        .with_context(|| format!("Failed to read snapshot {}", snapshot.display()))?;
    println!("\n📂 Snapshot from {}: {} properties", snapshot.generated, snapshot.total_properties);

    let mut store = SqliteStore::open(db, &config.table)
        .with_context(|| format!("Failed to open store {}", db.display()))?;
    let bulk = BulkLoader::new(&config.load);

    println!("\n💾 Loading in batches of {}...", config.load.batch_size);
    let report = bulk.load(&mut store, &snapshot.properties);
    println!(
        "✓ Loaded {}/{} ({:.1}%) in {} batches",
        report.loaded,
        report.total,
        report.success_rate() * 100.0,
        report.batches
    );

    if !report.failed_apns.is_empty() {
        fs::write(failed_out, report.failed_apns.join("\n") + "\n")
            .with_context(|| format!("Failed to write {}", failed_out.display()))?;
        println!("⚠️  {} records failed, APNs saved to {}", report.failed_apns.len(), failed_out.display());
    }

    println!("\n🔍 Verifying store...");
    let verification = bulk.verify(&store, &snapshot.properties)?;
    println!("✓ Store contains {} records", verification.store_total);
    if verification.is_match() {
        println!("✅ All {} snapshot records present", verification.found);
    } else {
        println!(
            "⚠️  {} of {} snapshot records missing",
            verification.missing(),
            verification.expected
        );
    }

    Ok(())
}

fn run_update(
    config: &PipelineConfig,
    parcels: &Path,
    db: &Path,
    vacancy: Option<&Path>,
    dry_run: bool,
    log_dir: &Path,
) -> Result<()> {
    println!("🔄 Parcel Master: update check");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let now = Utc::now();
    let fresh = ParcelLoader::new(config, now).load(parcels)?.records;
    if fresh.is_empty() {
        return Err(PipelineError::EmptyDataset(SourceKind::Parcel).into());
    }
    let vacancy = match vacancy {
        Some(path) => Some(VacancyLoader::new(config).load(path)?.records),
        None => None,
    };

    if !db.exists() {
        bail!("Store {} not found; run `parcel-master import` first", db.display());
    }
    let mut store = SqliteStore::open(db, &config.table)
        .with_context(|| format!("Failed to open store {}", db.display()))?;
    let stored: HashMap<String, ParcelRecord> = store
        .fetch_all()?
        .into_iter()
        .map(|p| (p.apn().to_string(), p))
        .collect();
    info!(fresh = fresh.len(), stored = stored.len(), "comparing snapshots");

    let detector = UpdateDetector::new(config.update.materiality_threshold);
    let report = detector.detect(&fresh, &stored, vacancy.as_ref(), now);

    println!("\n📊 Changes detected");
    println!("   New properties: {}", report.new_properties.len());
    println!("   Title transfers: {}", report.title_transfers.len());
    println!("   Value changes: {}", report.value_changes.len());
    println!("   Vacancy changes: {}", report.vacancy_changes.len());

    let log_path = report.write_log(log_dir, now).context("Failed to write update log")?;
    println!("✓ Update log: {}", log_path.display());

    if dry_run {
        println!("\n(dry run, store not modified)");
        return Ok(());
    }

    let summary = detector.apply(&mut store, &report, &fresh, now)?;
    println!("\n✅ Applied {} transfers, added {} properties", summary.transfers_applied, summary.properties_added);

    Ok(())
}

fn run_split(config: &PipelineConfig, input: &Path, chunk_size: Option<usize>, out_dir: &Path) -> Result<()> {
    let splitter = match chunk_size {
        Some(0) => bail!("--chunk-size must be greater than 0"),
        Some(size) => SqlSplitter::with_chunk_size(size),
        None => SqlSplitter::new(&config.split),
    };

    let written = splitter
        .split_file(input, out_dir)
        .with_context(|| format!("Failed to split {}", input.display()))?;

    println!("✂️  Created {} files. Run them in order:", written.len());
    for (i, path) in written.iter().enumerate() {
        println!("  {}. {}", i + 1, path.display());
    }

    Ok(())
}

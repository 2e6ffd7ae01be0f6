// 📤 Emitter - SQL upsert artifact and JSON backup snapshot
//
// The SQL artifact is conflict-resolved on apn: owner fields keep the stored
// value when the incoming one is NULL, value and computed fields are always
// overwritten, and a content-hash guard turns replays into no-ops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::model::ParcelRecord;

// ============================================================================
// COLUMN CONTRACT
// ============================================================================

/// Columns written by every upsert, in order
pub const UPSERT_COLUMNS: &[&str] = &[
    "apn",
    "property_address",
    "city",
    "state",
    "zip_code",
    "owner_name",
    "owner_mailing_address",
    "is_absentee",
    "land_value",
    "improvement_value",
    "total_value",
    "latitude",
    "longitude",
    "is_vacant",
    "data_source",
    "content_hash",
];

/// Owner fields: incoming NULL never erases a stored value
pub const COALESCED_COLUMNS: &[&str] = &["owner_name", "owner_mailing_address"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    fn now(&self) -> &'static str {
        match self {
            SqlDialect::Postgres => "NOW()",
            SqlDialect::Sqlite => "excluded.updated_at",
        }
    }

    fn distinct(&self) -> &'static str {
        match self {
            SqlDialect::Postgres => "IS DISTINCT FROM",
            SqlDialect::Sqlite => "IS NOT",
        }
    }
}

/// `ON CONFLICT` clause shared by the SQL artifact and the SQLite store
pub fn conflict_clause(table: &str, dialect: SqlDialect) -> String {
    let mut assignments: Vec<String> = UPSERT_COLUMNS
        .iter()
        .filter(|c| **c != "apn")
        .map(|column| {
            if COALESCED_COLUMNS.contains(column) {
                format!("    {c} = COALESCE(EXCLUDED.{c}, {t}.{c})", c = column, t = table)
            } else {
                format!("    {c} = EXCLUDED.{c}", c = column)
            }
        })
        .collect();
    assignments.push(format!("    updated_at = {}", dialect.now()));

    format!(
        "ON CONFLICT (apn) DO UPDATE SET\n{}\nWHERE {t}.content_hash {op} EXCLUDED.content_hash",
        assignments.join(",\n"),
        t = table,
        op = dialect.distinct()
    )
}

/// `INSERT INTO t (...) VALUES` header with the explicit column list
pub fn insert_header(table: &str) -> String {
    let mut header = format!("INSERT INTO {} (\n", table);
    for chunk in UPSERT_COLUMNS.chunks(4) {
        let last = chunk.last().copied() == UPSERT_COLUMNS.last().copied();
        header.push_str("    ");
        header.push_str(&chunk.join(", "));
        header.push_str(if last { "\n" } else { ",\n" });
    }
    header.push_str(") VALUES");
    header
}

// ============================================================================
// SQL LITERALS
// ============================================================================

fn text(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn nullable_text(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => text(v),
        _ => "NULL".to_string(),
    }
}

fn nullable_number(value: Option<f64>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "NULL".to_string(),
    }
}

/// One `( ... )` tuple in column order
pub fn values_tuple(record: &ParcelRecord) -> String {
    let fields = [
        text(record.apn()),
        text(&record.street_address),
        text(&record.city),
        text(&record.state),
        text(&record.zip),
        nullable_text(record.owner_name.as_deref()),
        nullable_text(record.owner_mailing_address.as_deref()),
        record.is_absentee.to_string(),
        record.land_value.to_string(),
        record.improvement_value.to_string(),
        record.total_value.to_string(),
        nullable_number(record.latitude),
        nullable_number(record.longitude),
        record.is_vacant.to_string(),
        text(record.data_source.as_str()),
        text(&record.content_hash()),
    ];
    format!("({})", fields.join(", "))
}

// ============================================================================
// SQL EMITTER
// ============================================================================

pub struct SqlEmitter {
    table: String,
}

impl SqlEmitter {
    pub fn new(table: impl Into<String>) -> Self {
        SqlEmitter { table: table.into() }
    }

    /// Write the full upsert statement. An empty record set produces
    /// comments only, since `VALUES` with no tuples is not valid SQL.
    pub fn write<'a, W, I>(&self, out: &mut W, records: I, generated_at: DateTime<Utc>) -> Result<usize>
    where
        W: Write,
        I: IntoIterator<Item = &'a ParcelRecord>,
    {
        let records: Vec<&ParcelRecord> = records.into_iter().collect();

        writeln!(out, "-- Parcel master import")?;
        writeln!(out, "-- Generated: {}", generated_at.to_rfc3339())?;
        writeln!(out, "-- Total properties: {}", records.len())?;
        writeln!(out)?;

        if records.is_empty() {
            writeln!(out, "-- No properties to import")?;
            return Ok(0);
        }

        writeln!(out, "{}", insert_header(&self.table))?;
        for (i, record) in records.iter().enumerate() {
            let separator = if i + 1 < records.len() { "," } else { "" };
            writeln!(out, "    {}{}", values_tuple(record), separator)?;
        }
        writeln!(out, "{};", conflict_clause(&self.table, SqlDialect::Postgres))?;

        Ok(records.len())
    }

    pub fn write_file<'a, I>(&self, path: &Path, records: I, generated_at: DateTime<Utc>) -> Result<usize>
    where
        I: IntoIterator<Item = &'a ParcelRecord>,
    {
        let mut out = BufWriter::new(File::create(path)?);
        let written = self.write(&mut out, records, generated_at)?;
        out.flush()?;
        info!(path = %path.display(), records = written, "SQL upsert artifact written");
        Ok(written)
    }
}

// ============================================================================
// BACKUP SNAPSHOT
// ============================================================================

/// Structured backup of a full master set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub generated: DateTime<Utc>,
    pub total_properties: usize,
    pub properties: Vec<ParcelRecord>,
}

impl BackupSnapshot {
    pub fn new<'a, I>(records: I, generated: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a ParcelRecord>,
    {
        let properties: Vec<ParcelRecord> = records.into_iter().cloned().collect();
        BackupSnapshot {
            generated,
            total_properties: properties.len(),
            properties,
        }
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut out, self)?;
        out.flush()?;
        info!(path = %path.display(), records = self.total_properties, "backup snapshot written");
        Ok(())
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

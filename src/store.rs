// 🗄️ Master Store - Bulk-load contract + SQLite implementation
// Upsert keyed by apn, content-hash guarded so a replayed batch changes nothing.
// Every applied change is also written to an append-only events table.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::emit::{conflict_clause, SqlDialect, UPSERT_COLUMNS};
use crate::error::Result;
use crate::model::{DataSource, ParcelRecord};

// ============================================================================
// STORE CONTRACT
// ============================================================================

/// What the pipeline needs from the store. Batch atomicity is not assumed:
/// the bulk loader handles failures itself.
pub trait MasterStore {
    /// Upsert records keyed by apn; replaying a batch is a no-op
    fn upsert_batch(&mut self, records: &[ParcelRecord]) -> Result<usize>;

    /// How many of `apns` exist in the store (post-load verification)
    fn count_by_keys(&self, apns: &[String]) -> Result<usize>;

    fn count(&self) -> Result<usize>;

    /// Every stored record, ordered by apn
    fn fetch_all(&self) -> Result<Vec<ParcelRecord>>;

    fn apply_title_transfer(&mut self, apn: &str, new_owner: &str, at: DateTime<Utc>) -> Result<()>;

    fn insert_new_property(&mut self, record: &ParcelRecord) -> Result<()>;

    fn record_event(&mut self, event: &PropertyEvent) -> Result<()>;
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Audit trail entry ("every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PropertyEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub apn: String,
    pub details: String,
    pub data: serde_json::Value,
}

impl PropertyEvent {
    pub fn new(event_type: &str, apn: &str, details: String, data: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            event_type: event_type.to_string(),
            apn: apn.to_string(),
            details,
            data,
        }
    }
}

// ============================================================================
// SQLITE STORE
// ============================================================================

/// SQLite needs a bound on host parameters per statement
const KEY_QUERY_CHUNK: usize = 500;

pub struct SqliteStore {
    conn: Connection,
    table: String,
}

impl SqliteStore {
    pub fn open(path: &Path, table: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // WAL for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn, table)
    }

    pub fn open_in_memory(table: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        let store = SqliteStore {
            conn,
            table: table.to_string(),
        };
        store.setup()?;
        Ok(store)
    }

    fn setup(&self) -> Result<()> {
        self.conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {t} (
                    apn TEXT PRIMARY KEY CHECK (length(apn) > 0),
                    property_address TEXT NOT NULL,
                    city TEXT NOT NULL DEFAULT '',
                    state TEXT NOT NULL DEFAULT '',
                    zip_code TEXT NOT NULL DEFAULT '',
                    owner_name TEXT,
                    owner_mailing_address TEXT,
                    is_absentee INTEGER NOT NULL DEFAULT 0,
                    land_value REAL NOT NULL DEFAULT 0 CHECK (land_value >= 0),
                    improvement_value REAL NOT NULL DEFAULT 0 CHECK (improvement_value >= 0),
                    total_value REAL NOT NULL DEFAULT 0 CHECK (total_value >= 0),
                    latitude REAL,
                    longitude REAL,
                    is_vacant INTEGER NOT NULL DEFAULT 0,
                    data_source TEXT NOT NULL DEFAULT 'county',
                    content_hash TEXT,
                    last_sale_date TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )",
                t = self.table
            ),
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS property_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT UNIQUE NOT NULL,
                timestamp TEXT NOT NULL,
                event_type TEXT NOT NULL,
                apn TEXT NOT NULL,
                details TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_property_events_apn ON property_events(apn)",
            [],
        )?;

        Ok(())
    }

    fn upsert_sql(&self) -> String {
        let columns: Vec<&str> = UPSERT_COLUMNS
            .iter()
            .copied()
            .chain(["created_at", "updated_at"])
            .collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

        format!(
            "INSERT INTO {} ({}) VALUES ({})\n{}",
            self.table,
            columns.join(", "),
            placeholders.join(", "),
            conflict_clause(&self.table, SqlDialect::Sqlite)
        )
    }

    /// Events for one parcel, newest first
    pub fn events_for(&self, apn: &str) -> Result<Vec<PropertyEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, timestamp, event_type, apn, details, data
             FROM property_events
             WHERE apn = ?1
             ORDER BY timestamp DESC, id DESC",
        )?;

        let events = stmt
            .query_map(params![apn], |row| {
                let timestamp: String = row.get(1)?;
                let data: String = row.get(5)?;
                Ok(PropertyEvent {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(&timestamp).unwrap_or_default(),
                    event_type: row.get(2)?,
                    apn: row.get(3)?,
                    details: row.get(4)?,
                    data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    pub fn event_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM property_events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn get(&self, apn: &str) -> Result<Option<ParcelRecord>> {
        let records = self.query_records(&format!("{} WHERE apn = ?1", self.select_sql()), params![apn])?;
        Ok(records.into_iter().next())
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT apn, property_address, city, state, zip_code, owner_name, owner_mailing_address,
                    is_absentee, land_value, improvement_value, latitude, longitude, is_vacant,
                    last_sale_date, created_at, updated_at
             FROM {}",
            self.table
        )
    }

    fn query_records<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ParcelRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let records = stmt
            .query_map(params, |row| {
                let apn: String = row.get(0)?;
                let address: String = row.get(1)?;
                let last_sale: Option<String> = row.get(13)?;
                let created_at: String = row.get(14)?;
                let updated_at: String = row.get(15)?;

                let mut record = ParcelRecord::new(apn, address, parse_timestamp(&created_at).unwrap_or_default());
                record.city = row.get(2)?;
                record.state = row.get(3)?;
                record.zip = row.get(4)?;
                record.owner_name = row.get(5)?;
                record.owner_mailing_address = row.get(6)?;
                record.is_absentee = row.get(7)?;
                record.set_values(row.get(8)?, row.get(9)?);
                record.latitude = row.get(10)?;
                record.longitude = row.get(11)?;
                record.is_vacant = row.get(12)?;
                record.last_sale_date = last_sale.as_deref().and_then(parse_timestamp);
                record.updated_at = parse_timestamp(&updated_at).unwrap_or(record.created_at);
                Ok(record)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

impl MasterStore for SqliteStore {
    fn upsert_batch(&mut self, records: &[ParcelRecord]) -> Result<usize> {
        let sql = self.upsert_sql();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(&sql)?;
            for r in records {
                stmt.execute(params![
                    r.apn(),
                    r.street_address,
                    r.city,
                    r.state,
                    r.zip,
                    r.owner_name.as_deref().filter(|s| !s.is_empty()),
                    r.owner_mailing_address.as_deref().filter(|s| !s.is_empty()),
                    r.is_absentee,
                    r.land_value,
                    r.improvement_value,
                    r.total_value,
                    r.latitude,
                    r.longitude,
                    r.is_vacant,
                    r.data_source.as_str(),
                    r.content_hash(),
                    r.created_at.to_rfc3339(),
                    r.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    fn count_by_keys(&self, apns: &[String]) -> Result<usize> {
        let mut found = 0usize;
        for chunk in apns.chunks(KEY_QUERY_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE apn IN ({})",
                self.table, placeholders
            );
            let count: i64 = self
                .conn
                .query_row(&sql, params_from_iter(chunk.iter()), |row| row.get(0))?;
            found += count as usize;
        }
        Ok(found)
    }

    fn count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn fetch_all(&self) -> Result<Vec<ParcelRecord>> {
        self.query_records(&format!("{} ORDER BY apn", self.select_sql()), params![])
    }

    fn apply_title_transfer(&mut self, apn: &str, new_owner: &str, at: DateTime<Utc>) -> Result<()> {
        // Row no longer matches any emitted hash; the next upsert must apply
        let at = at.to_rfc3339();
        self.conn.execute(
            &format!(
                "UPDATE {} SET owner_name = ?1, last_sale_date = ?2, updated_at = ?2, content_hash = NULL WHERE apn = ?3",
                self.table
            ),
            params![new_owner, at, apn],
        )?;
        Ok(())
    }

    fn insert_new_property(&mut self, record: &ParcelRecord) -> Result<()> {
        // DO NOTHING: a re-run must not clobber a row inserted by an earlier run
        self.conn.execute(
            &format!(
                "INSERT INTO {} (apn, property_address, city, state, owner_name, data_source, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT (apn) DO NOTHING",
                self.table
            ),
            params![
                record.apn(),
                record.street_address,
                record.city,
                record.state,
                record.owner_name,
                DataSource::County.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn record_event(&mut self, event: &PropertyEvent) -> Result<()> {
        self.conn.execute(
            "INSERT INTO property_events (event_id, timestamp, event_type, apn, details, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                event.apn,
                event.details,
                serde_json::to_string(&event.data)?,
            ],
        )?;
        Ok(())
    }
}

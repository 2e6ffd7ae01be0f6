// 📥 Source Loaders - Parcel, owner and vacancy inputs
// One loader per dataset behind a common trait. Row problems are counted
// and skipped; only an unreadable file stops the run.

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::model::{OwnerIndex, OwnerRecord, ParcelRecord, SourceKind, VacancyIndex, VacancyMark};
use crate::normalize::normalize_address;

// ============================================================================
// COLUMN CONTRACTS
// ============================================================================

pub mod columns {
    pub const APN: &str = "APN";
    pub const SITUS_CITY: &str = "SitusCity";
    pub const SITUS_STREET_NUMBER: &str = "SitusStreetNumber";
    pub const SITUS_STREET_NAME: &str = "SitusStreetName";
    pub const SITUS_UNIT: &str = "SitusUnit";
    pub const SITUS_ADDRESS: &str = "SitusAddress";
    pub const SITUS_ZIP: &str = "SitusZip";
    pub const CENTROID_X: &str = "CENTROID_X";
    pub const CENTROID_Y: &str = "CENTROID_Y";
    pub const LAND: &str = "Land";
    pub const IMPS: &str = "Imps";
    pub const TOTAL_VALUE: &str = "TotalValue";
    pub const MAILING_ADDRESS: &str = "MailingAddress";
    pub const OWNER_NAME: &str = "OwnerName";

    pub const PROPERTY_ADDRESS: &str = "property_address";
    pub const OWNER_OWNER_NAME: &str = "owner_name";
    pub const OWNER_MAILING_ADDRESS: &str = "owner_mailing_address";
    pub const IS_ABSENTEE: &str = "is_absentee";
    pub const OWNER_CITY: &str = "city";
}

// ============================================================================
// LOAD STATISTICS
// ============================================================================

/// Per-source counters. Statistics only; not part of the data contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub rows_read: usize,
    pub kept: usize,
    pub dropped_jurisdiction: usize,
    pub dropped_missing_key: usize,
    pub malformed_rows: usize,
    pub defaulted_fields: usize,
    pub duplicate_keys: usize,
}

impl LoadStats {
    fn log(&self, kind: SourceKind) {
        info!(
            source = %kind,
            rows = self.rows_read,
            kept = self.kept,
            other_jurisdiction = self.dropped_jurisdiction,
            missing_key = self.dropped_missing_key,
            malformed = self.malformed_rows,
            defaulted = self.defaulted_fields,
            duplicates = self.duplicate_keys,
            "source loaded"
        );
    }
}

/// Loader output: the keyed records plus how we got there
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub records: T,
    pub stats: LoadStats,
}

// ============================================================================
// LOADER TRAIT
// ============================================================================

/// SourceLoader - one implementation per input dataset
pub trait SourceLoader {
    type Output;

    fn source_kind(&self) -> SourceKind;

    /// Load from any reader (files, in-memory buffers in tests)
    fn load_reader<R: Read>(&self, reader: R) -> Result<Loaded<Self::Output>>;

    /// Open and load a file. A missing or unreadable file is fatal for the run.
    fn load(&self, path: &Path) -> Result<Loaded<Self::Output>> {
        let file = File::open(path).map_err(|source| PipelineError::SourceUnavailable {
            kind: self.source_kind(),
            path: path.to_path_buf(),
            source,
        })?;

        let loaded = self.load_reader(file)?;
        loaded.stats.log(self.source_kind());
        Ok(loaded)
    }
}

// ============================================================================
// HEADER LOOKUP
// ============================================================================

/// Column-name → position map for one file's header row
struct Columns {
    positions: HashMap<String, usize>,
}

impl Columns {
    fn from_header(header: &StringRecord) -> Self {
        let positions = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim_start_matches('\u{feff}').trim().to_string(), i))
            .collect();
        Columns { positions }
    }

    fn has(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Trimmed cell value; missing column or short row reads as empty
    fn get<'r>(&self, record: &'r StringRecord, name: &str) -> &'r str {
        self.positions
            .get(name)
            .and_then(|&i| record.get(i))
            .map(str::trim)
            .unwrap_or("")
    }
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::None)
        .from_reader(reader)
}

/// Read the next record, turning per-row decode errors into a skip.
/// I/O errors mid-file are still fatal.
fn next_row<R: Read>(
    records: &mut csv::StringRecordsIter<'_, R>,
    stats: &mut LoadStats,
    kind: SourceKind,
) -> Option<Result<StringRecord>> {
    loop {
        match records.next()? {
            Ok(record) => {
                stats.rows_read += 1;
                return Some(Ok(record));
            }
            Err(err) if err.is_io_error() => return Some(Err(err.into())),
            Err(err) => {
                stats.rows_read += 1;
                stats.malformed_rows += 1;
                warn!(source = %kind, error = %err, "skipping malformed row");
            }
        }
    }
}

fn in_jurisdiction(city: &str, municipality_upper: &str) -> bool {
    city.to_uppercase().contains(municipality_upper)
}

/// Parse a numeric cell. Empty reads as 0; anything unparseable is `None`.
fn parse_number(cell: &str) -> Option<f64> {
    if cell.is_empty() {
        return Some(0.0);
    }
    cell.replace(['$', ','], "").parse::<f64>().ok()
}

fn non_empty(cell: &str) -> Option<String> {
    if cell.is_empty() {
        None
    } else {
        Some(cell.to_string())
    }
}

// ============================================================================
// PARCEL LOADER
// ============================================================================

/// County parcel file → parcels keyed by APN (last row wins on duplicates)
pub struct ParcelLoader {
    municipality: String,
    city: String,
    state: String,
    loaded_at: DateTime<Utc>,
}

impl ParcelLoader {
    pub fn new(config: &PipelineConfig, loaded_at: DateTime<Utc>) -> Self {
        ParcelLoader {
            municipality: config.municipality.trim().to_uppercase(),
            city: title_case(config.municipality.trim()),
            state: config.state.clone(),
            loaded_at,
        }
    }

    fn street_address(cols: &Columns, record: &StringRecord) -> String {
        let number = cols.get(record, columns::SITUS_STREET_NUMBER);
        let name = cols.get(record, columns::SITUS_STREET_NAME);
        let unit = cols.get(record, columns::SITUS_UNIT);

        let mut address = format!("{} {}", number, name).trim().to_string();
        if !unit.is_empty() {
            address.push(' ');
            address.push_str(unit);
        }

        if address.is_empty() {
            address = cols.get(record, columns::SITUS_ADDRESS).to_string();
        }
        address
    }
}

impl SourceLoader for ParcelLoader {
    type Output = BTreeMap<String, ParcelRecord>;

    fn source_kind(&self) -> SourceKind {
        SourceKind::Parcel
    }

    fn load_reader<R: Read>(&self, reader: R) -> Result<Loaded<Self::Output>> {
        let mut rdr = csv_reader(reader);
        let cols = Columns::from_header(rdr.headers()?);
        if !cols.has(columns::APN) {
            warn!("parcel source has no {} column; every row will be skipped", columns::APN);
        }
        // Monthly county extracts carry only the assessed total
        let total_only =
            !cols.has(columns::LAND) && !cols.has(columns::IMPS) && cols.has(columns::TOTAL_VALUE);

        let mut parcels = BTreeMap::new();
        let mut stats = LoadStats::default();
        let mut rows = rdr.records();

        while let Some(row) = next_row(&mut rows, &mut stats, SourceKind::Parcel) {
            let record = row?;

            if !in_jurisdiction(cols.get(&record, columns::SITUS_CITY), &self.municipality) {
                stats.dropped_jurisdiction += 1;
                continue;
            }

            let apn = cols.get(&record, columns::APN);
            if apn.is_empty() {
                stats.dropped_missing_key += 1;
                continue;
            }

            let mut parcel = ParcelRecord::new(apn, Self::street_address(&cols, &record), self.loaded_at);
            parcel.city = self.city.clone();
            parcel.state = self.state.clone();
            parcel.zip = cols.get(&record, columns::SITUS_ZIP).to_string();
            parcel.owner_mailing_address = non_empty(cols.get(&record, columns::MAILING_ADDRESS));
            parcel.owner_name = non_empty(cols.get(&record, columns::OWNER_NAME));

            // Coordinates and values fall back as pairs, never per field
            match (
                parse_number(cols.get(&record, columns::CENTROID_Y)),
                parse_number(cols.get(&record, columns::CENTROID_X)),
            ) {
                (Some(lat), Some(lon)) => parcel.set_coordinates(lat, lon),
                _ => {
                    stats.defaulted_fields += 1;
                    debug!(apn, "unparseable coordinates, using (0, 0)");
                    parcel.set_coordinates(0.0, 0.0);
                }
            }

            if total_only {
                match parse_number(cols.get(&record, columns::TOTAL_VALUE)) {
                    Some(total) => parcel.set_total_only(total),
                    None => {
                        stats.defaulted_fields += 1;
                        debug!(apn, "unparseable total value, using 0");
                        parcel.set_values(0.0, 0.0);
                    }
                }
            } else {
                match (
                    parse_number(cols.get(&record, columns::LAND)),
                    parse_number(cols.get(&record, columns::IMPS)),
                ) {
                    (Some(land), Some(imps)) => parcel.set_values(land, imps),
                    _ => {
                        stats.defaulted_fields += 1;
                        debug!(apn, "unparseable values, using 0");
                        parcel.set_values(0.0, 0.0);
                    }
                }
            }

            if parcels.insert(apn.to_string(), parcel).is_some() {
                stats.duplicate_keys += 1;
            }
        }

        stats.kept = parcels.len();
        Ok(Loaded {
            records: parcels,
            stats,
        })
    }
}

// ============================================================================
// OWNER LOADER
// ============================================================================

/// Owner-of-record list → owners keyed by normalized address
pub struct OwnerLoader {
    municipality: String,
}

impl OwnerLoader {
    pub fn new(config: &PipelineConfig) -> Self {
        OwnerLoader {
            municipality: config.municipality.trim().to_uppercase(),
        }
    }
}

impl SourceLoader for OwnerLoader {
    type Output = OwnerIndex;

    fn source_kind(&self) -> SourceKind {
        SourceKind::Owner
    }

    fn load_reader<R: Read>(&self, reader: R) -> Result<Loaded<Self::Output>> {
        let mut rdr = csv_reader(reader);
        let cols = Columns::from_header(rdr.headers()?);
        // Owner lists are usually pre-filtered; only filter when a city column exists
        let filter_city = cols.has(columns::OWNER_CITY);

        let mut owners = OwnerIndex::new();
        let mut stats = LoadStats::default();
        let mut rows = rdr.records();

        while let Some(row) = next_row(&mut rows, &mut stats, SourceKind::Owner) {
            let record = row?;

            if filter_city && !in_jurisdiction(cols.get(&record, columns::OWNER_CITY), &self.municipality) {
                stats.dropped_jurisdiction += 1;
                continue;
            }

            let address_key = normalize_address(cols.get(&record, columns::PROPERTY_ADDRESS));
            if address_key.is_empty() {
                stats.dropped_missing_key += 1;
                continue;
            }

            let owner = OwnerRecord {
                address_key: address_key.clone(),
                owner_name: non_empty(cols.get(&record, columns::OWNER_OWNER_NAME)),
                owner_mailing_address: non_empty(cols.get(&record, columns::OWNER_MAILING_ADDRESS)),
                is_absentee: cols.get(&record, columns::IS_ABSENTEE).eq_ignore_ascii_case("true"),
            };

            // Last write wins
            if owners.insert(address_key, owner).is_some() {
                stats.duplicate_keys += 1;
            }
        }

        stats.kept = owners.len();
        Ok(Loaded {
            records: owners,
            stats,
        })
    }
}

// ============================================================================
// VACANCY LOADER
// ============================================================================

/// Semi-structured vacancy list → independent id and address sets
pub struct VacancyLoader {
    match_token: String,
    header_lines: usize,
    apn_column: usize,
    address_column: usize,
    min_columns: usize,
}

impl VacancyLoader {
    pub fn new(config: &PipelineConfig) -> Self {
        VacancyLoader {
            match_token: config.vacancy.match_token.clone(),
            header_lines: config.vacancy.header_lines,
            apn_column: config.vacancy.apn_column,
            address_column: config.vacancy.address_column,
            min_columns: config.vacancy.min_columns,
        }
    }

    /// Split one line as CSV so quoted commas stay inside their field
    fn split_line(line: &str) -> Option<StringRecord> {
        ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(line.as_bytes())
            .records()
            .next()
            .and_then(|r| r.ok())
    }

    /// Marks asserted by one qualifying line (zero, one or two)
    fn marks_for_line(&self, line: &str, stats: &mut LoadStats) -> Vec<VacancyMark> {
        let mut marks = Vec::new();

        let Some(fields) = Self::split_line(line) else {
            stats.malformed_rows += 1;
            return marks;
        };
        if fields.len() <= self.min_columns {
            stats.malformed_rows += 1;
            return marks;
        }

        let apn = fields.get(self.apn_column).unwrap_or("").trim();
        if !apn.is_empty() {
            marks.push(VacancyMark::Apn(apn.to_string()));
        }

        let address_key = normalize_address(fields.get(self.address_column).unwrap_or(""));
        if !address_key.is_empty() {
            marks.push(VacancyMark::Address(address_key));
        }

        if marks.is_empty() {
            stats.dropped_missing_key += 1;
        }
        marks
    }
}

impl SourceLoader for VacancyLoader {
    type Output = VacancyIndex;

    fn source_kind(&self) -> SourceKind {
        SourceKind::Vacancy
    }

    fn load_reader<R: Read>(&self, reader: R) -> Result<Loaded<Self::Output>> {
        let mut index = VacancyIndex::default();
        let mut stats = LoadStats::default();

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut line_no = 0usize;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_no += 1;
            if line_no <= self.header_lines {
                continue;
            }

            // A stray non-UTF-8 byte costs one line, not the whole list
            let Ok(text) = std::str::from_utf8(&buf) else {
                stats.rows_read += 1;
                stats.malformed_rows += 1;
                warn!(source = %SourceKind::Vacancy, line = line_no, "skipping line that is not valid UTF-8");
                continue;
            };
            let line = text.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            stats.rows_read += 1;

            if !line.contains(self.match_token.as_str()) {
                stats.dropped_jurisdiction += 1;
                continue;
            }

            let marks = self.marks_for_line(line, &mut stats);
            if !marks.is_empty() {
                stats.kept += 1;
            }
            for mark in marks {
                index.insert(mark);
            }
        }

        debug!(
            by_apn = index.by_apn.len(),
            by_address = index.by_address.len(),
            "vacancy sets built"
        );
        Ok(Loaded {
            records: index,
            stats,
        })
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

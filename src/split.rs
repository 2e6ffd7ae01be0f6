// ✂️ SQL Chunker - Split one upsert artifact into independently runnable files
//
// Every chunk repeats the INSERT header (column contract) and the ON CONFLICT
// footer, so chunks can be applied in any order and re-applied safely.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::SplitConfig;
use crate::error::{PipelineError, Result};

// ============================================================================
// ARTIFACT PARSING
// ============================================================================

/// An upsert statement taken apart into header, value tuples and footer
#[derive(Debug, Clone, PartialEq)]
pub struct SqlArtifact {
    /// `INSERT INTO ... VALUES`
    pub header: String,

    /// One `( ... )` per record, without separators
    pub tuples: Vec<String>,

    /// `ON CONFLICT ... ;`
    pub footer: String,
}

impl SqlArtifact {
    pub fn parse(sql: &str) -> Result<Self> {
        let insert_at = sql
            .find("INSERT INTO")
            .ok_or_else(|| PipelineError::MalformedArtifact("no INSERT statement".to_string()))?;
        let values_at = sql[insert_at..]
            .find("VALUES")
            .map(|offset| insert_at + offset)
            .ok_or_else(|| PipelineError::MalformedArtifact("INSERT without VALUES".to_string()))?;
        let body_at = values_at + "VALUES".len();

        let (tuples, rest) = scan_tuples(&sql[body_at..])?;
        if tuples.is_empty() {
            return Err(PipelineError::MalformedArtifact("VALUES list is empty".to_string()));
        }

        let footer = rest.trim();
        Ok(SqlArtifact {
            header: sql[insert_at..body_at].to_string(),
            tuples,
            footer: if footer.is_empty() { ";".to_string() } else { footer.to_string() },
        })
    }
}

/// Collect `( ... )` tuples until something else starts; returns the remainder
fn scan_tuples(body: &str) -> Result<(Vec<String>, &str)> {
    let bytes = body.as_bytes();
    let mut tuples = Vec::new();
    let mut i = 0;

    loop {
        while i < bytes.len() {
            match bytes[i] {
                b' ' | b'\t' | b'\r' | b'\n' | b',' => i += 1,
                b'-' if bytes.get(i + 1) == Some(&b'-') => {
                    i = body[i..].find('\n').map_or(bytes.len(), |n| i + n + 1);
                }
                _ => break,
            }
        }

        if i >= bytes.len() || bytes[i] != b'(' {
            return Ok((tuples, &body[i..]));
        }

        let end = tuple_end(bytes, i).ok_or_else(|| {
            PipelineError::MalformedArtifact(format!("unterminated tuple #{}", tuples.len() + 1))
        })?;
        tuples.push(body[i..=end].to_string());
        i = end + 1;
    }
}

/// Index of the `)` closing the tuple opened at `start`.
/// Parentheses inside quoted literals don't count; `''` is an escaped quote.
fn tuple_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut i = start;

    while i < bytes.len() {
        let b = bytes[i];
        if in_quote {
            if b == b'\'' {
                if bytes.get(i + 1) == Some(&b'\'') {
                    i += 1;
                } else {
                    in_quote = false;
                }
            }
        } else {
            match b {
                b'\'' => in_quote = true,
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

// ============================================================================
// SPLITTER
// ============================================================================

pub struct SqlSplitter {
    chunk_size: usize,
}

impl SqlSplitter {
    pub fn new(config: &SplitConfig) -> Self {
        Self::with_chunk_size(config.chunk_size)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        SqlSplitter {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Render each chunk as a complete statement
    pub fn split(&self, artifact: &SqlArtifact) -> Vec<String> {
        let total = artifact.tuples.len().div_ceil(self.chunk_size);

        artifact
            .tuples
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(i, tuples)| {
                let mut sql = format!(
                    "-- Parcel master import - chunk {} of {} ({} properties)\n",
                    i + 1,
                    total,
                    tuples.len()
                );
                sql.push_str(&artifact.header);
                sql.push('\n');
                sql.push_str(
                    &tuples
                        .iter()
                        .map(|t| format!("    {}", t))
                        .collect::<Vec<_>>()
                        .join(",\n"),
                );
                sql.push('\n');
                sql.push_str(&artifact.footer);
                sql.push('\n');
                sql
            })
            .collect()
    }

    /// Write `{stem}_chunk_NN.sql` files into `out_dir`, numbered from 01
    pub fn split_file(&self, input: &Path, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let sql = fs::read_to_string(input)?;
        let artifact = SqlArtifact::parse(&sql)?;
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("import");

        fs::create_dir_all(out_dir)?;
        let mut written = Vec::new();
        for (i, chunk) in self.split(&artifact).iter().enumerate() {
            let path = out_dir.join(format!("{}_chunk_{:02}.sql", stem, i + 1));
            fs::write(&path, chunk)?;
            written.push(path);
        }

        info!(
            input = %input.display(),
            records = artifact.tuples.len(),
            chunks = written.len(),
            "SQL artifact split"
        );
        Ok(written)
    }
}

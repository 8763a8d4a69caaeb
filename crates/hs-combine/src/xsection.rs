//! Cross-section table.
//!
//! A flat text file maps full dataset paths to a production cross-section in
//! pb, with the sentinel `-1` marking real collision data (no reweighting).
//! The table is built once per run and immutable afterwards; lookups are
//! prefix-based so the table can carry tune/campaign-qualified keys while
//! lookups use the shorter canonical names.

use std::fs;
use std::path::Path;

use hs_core::{Error, Result};

use crate::dataset;

/// Sentinel cross-section value marking real collision data.
pub const DATA_SENTINEL: &str = "-1";

/// Insertion-ordered map of canonical dataset name to raw cross-section
/// string. The value stays a string to preserve the `-1` sentinel exactly.
#[derive(Debug, Clone, Default)]
pub struct XsectionTable {
    entries: Vec<(String, String)>,
}

impl XsectionTable {
    /// Parse a cross-section file: `#`-comment and blank lines ignored, each
    /// data line exactly two whitespace-separated tokens
    /// (`<fullDatasetPath> <xsectionPbOrMinusOne>`).
    pub fn parse(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read cross-section file {}: {}", path.display(), e))
        })?;
        let mut entries = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.starts_with('#') {
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let (dataset, value) = match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(d), Some(v), None) => (d, v),
                _ => {
                    return Err(Error::Config(format!(
                        "could not split line {} of {}: \"{}\"",
                        lineno + 1,
                        path.display(),
                        line
                    )))
                }
            };
            let key = dataset::sanitize_full_dataset(dataset)?;
            entries.push((key, value.to_string()));
        }
        Ok(Self { entries })
    }

    /// Build a table from pre-sanitized entries (used in tests and by the
    /// QCD closure fixtures).
    pub fn from_entries(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    /// Look up the cross-section for a canonical dataset name.
    ///
    /// Returns the value of the first entry whose key starts with `name`.
    /// An empty table or a name with no matching entry is a fatal
    /// configuration error: there is no sensible partial result without a
    /// cross-section.
    pub fn lookup(&self, name: &str) -> Result<&str> {
        if self.entries.is_empty() {
            return Err(Error::Config(format!(
                "cross-section table is empty; cannot look up '{}'",
                name
            )));
        }
        self.entries
            .iter()
            .find(|(key, _)| key.starts_with(name))
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| {
                Error::Config(format!("cross-section table has no entry for '{}'", name))
            })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether a raw cross-section value is the real-data sentinel.
pub fn is_data(xsection: &str) -> bool {
    xsection == DATA_SENTINEL
}

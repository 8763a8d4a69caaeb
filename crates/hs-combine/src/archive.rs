//! Plots archives: the histogram container read and written by the engine.
//!
//! An archive holds named 1-D/2-D histograms plus the
//! `systematicNameToBranchesMap` associative object. Bin arrays include the
//! under/overflow cells (index 0 and `n_bins + 1`) and carry an explicit
//! sum-of-weights-squared per bin: negative-weight Monte-Carlo events make
//! `error = sqrt(contents)` invalid, so variances are accumulated, never
//! re-derived.
//!
//! Per-piece archives carry bare object names (`SumOfWeights`,
//! `systematics`, analysis variables); combined archives carry
//! `histo1D__{sample}__{var}`-style prefixed names applied at write time.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use hs_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// A 1-D histogram with under/overflow and per-bin variances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histo1D {
    /// Object name.
    pub name: String,
    /// Number of bins (excluding under/overflow).
    pub n_bins: usize,
    /// Lower edge of first bin.
    pub x_min: f64,
    /// Upper edge of last bin.
    pub x_max: f64,
    /// Optional per-bin labels (selection-flow histograms).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub x_labels: Vec<String>,
    /// Bin contents, length `n_bins + 2` (index 0 = underflow).
    pub bin_content: Vec<f64>,
    /// Sum of weights squared per bin, same length as `bin_content`.
    pub sumw2: Vec<f64>,
    /// Total number of entries.
    pub entries: f64,
}

impl Histo1D {
    /// An empty histogram with the given binning.
    pub fn new(name: &str, n_bins: usize, x_min: f64, x_max: f64) -> Self {
        Self {
            name: name.to_string(),
            n_bins,
            x_min,
            x_max,
            x_labels: Vec::new(),
            bin_content: vec![0.0; n_bins + 2],
            sumw2: vec![0.0; n_bins + 2],
            entries: 0.0,
        }
    }

    /// Number of cells including under/overflow.
    pub fn n_cells(&self) -> usize {
        self.n_bins + 2
    }

    /// Scale contents by `factor`; variances scale by `factor²`.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.bin_content {
            *v *= factor;
        }
        let f2 = factor * factor;
        for v in &mut self.sumw2 {
            *v *= f2;
        }
    }

    /// Add `coeff × other` bin by bin; variances always add with `coeff²`.
    pub fn add_scaled(&mut self, other: &Histo1D, coeff: f64) -> Result<()> {
        if other.n_bins != self.n_bins {
            return Err(Error::Validation(format!(
                "cannot add histogram '{}' ({} bins) into '{}' ({} bins)",
                other.name, other.n_bins, self.name, self.n_bins
            )));
        }
        let c2 = coeff * coeff;
        for (a, b) in self.bin_content.iter_mut().zip(other.bin_content.iter()) {
            *a += coeff * b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(other.sumw2.iter()) {
            *a += c2 * b;
        }
        self.entries += other.entries;
        Ok(())
    }

    /// Add `other` bin by bin.
    pub fn add(&mut self, other: &Histo1D) -> Result<()> {
        self.add_scaled(other, 1.0)
    }

    /// Zero every negative bin content (fake-rate floor policy).
    pub fn zero_negative_bins(&mut self) {
        for v in &mut self.bin_content {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
    }

    /// Data bin (1-based) for a bin label, if the axis is labeled.
    pub fn find_label_bin(&self, label: &str) -> Option<usize> {
        self.x_labels.iter().position(|l| l == label).map(|i| i + 1)
    }

    /// Sum of in-range bin contents.
    pub fn integral(&self) -> f64 {
        self.bin_content[1..=self.n_bins].iter().sum()
    }
}

/// A 2-D histogram with under/overflow on both axes.
///
/// The per-sample `systematics` object is one of these with labeled axes:
/// x = selection name, y = systematic-variation name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histo2D {
    /// Object name.
    pub name: String,
    pub n_bins_x: usize,
    pub x_min: f64,
    pub x_max: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub x_labels: Vec<String>,
    pub n_bins_y: usize,
    pub y_min: f64,
    pub y_max: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub y_labels: Vec<String>,
    /// Row-major contents, length `(n_bins_x + 2) * (n_bins_y + 2)`.
    pub bin_content: Vec<f64>,
    /// Sum of weights squared per cell, same length as `bin_content`.
    pub sumw2: Vec<f64>,
    /// Total number of entries.
    pub entries: f64,
}

impl Histo2D {
    /// An empty histogram with the given binning.
    pub fn new(name: &str, n_bins_x: usize, n_bins_y: usize) -> Self {
        let cells = (n_bins_x + 2) * (n_bins_y + 2);
        Self {
            name: name.to_string(),
            n_bins_x,
            x_min: 0.0,
            x_max: n_bins_x as f64,
            x_labels: Vec::new(),
            n_bins_y,
            y_min: 0.0,
            y_max: n_bins_y as f64,
            y_labels: Vec::new(),
            bin_content: vec![0.0; cells],
            sumw2: vec![0.0; cells],
            entries: 0.0,
        }
    }

    fn cell(&self, ix: usize, iy: usize) -> usize {
        iy * (self.n_bins_x + 2) + ix
    }

    pub fn content(&self, ix: usize, iy: usize) -> f64 {
        self.bin_content[self.cell(ix, iy)]
    }

    pub fn variance(&self, ix: usize, iy: usize) -> f64 {
        self.sumw2[self.cell(ix, iy)]
    }

    pub fn set_content(&mut self, ix: usize, iy: usize, value: f64) {
        let cell = self.cell(ix, iy);
        self.bin_content[cell] = value;
    }

    pub fn set_variance(&mut self, ix: usize, iy: usize, value: f64) {
        let cell = self.cell(ix, iy);
        self.sumw2[cell] = value;
    }

    /// Scale contents by `factor`; variances scale by `factor²`.
    pub fn scale(&mut self, factor: f64) {
        for v in &mut self.bin_content {
            *v *= factor;
        }
        let f2 = factor * factor;
        for v in &mut self.sumw2 {
            *v *= f2;
        }
    }

    /// Add `coeff × other` cell by cell; variances always add with `coeff²`.
    pub fn add_scaled(&mut self, other: &Histo2D, coeff: f64) -> Result<()> {
        if other.n_bins_x != self.n_bins_x || other.n_bins_y != self.n_bins_y {
            return Err(Error::Validation(format!(
                "cannot add histogram '{}' ({}x{} bins) into '{}' ({}x{} bins)",
                other.name,
                other.n_bins_x,
                other.n_bins_y,
                self.name,
                self.n_bins_x,
                self.n_bins_y
            )));
        }
        let c2 = coeff * coeff;
        for (a, b) in self.bin_content.iter_mut().zip(other.bin_content.iter()) {
            *a += coeff * b;
        }
        for (a, b) in self.sumw2.iter_mut().zip(other.sumw2.iter()) {
            *a += c2 * b;
        }
        self.entries += other.entries;
        Ok(())
    }

    /// Add `other` cell by cell.
    pub fn add(&mut self, other: &Histo2D) -> Result<()> {
        self.add_scaled(other, 1.0)
    }

    /// Zero every negative cell content.
    pub fn zero_negative_bins(&mut self) {
        for v in &mut self.bin_content {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
    }

    /// Data bin (1-based) for an x-axis label.
    pub fn find_x_label_bin(&self, label: &str) -> Option<usize> {
        self.x_labels.iter().position(|l| l == label).map(|i| i + 1)
    }

    /// Data bin (1-based) for a y-axis label.
    pub fn find_y_label_bin(&self, label: &str) -> Option<usize> {
        self.y_labels.iter().position(|l| l == label).map(|i| i + 1)
    }

    /// Append labeled y rows (zero-filled) if not already present.
    pub fn add_y_rows(&mut self, labels: &[&str]) {
        let missing: Vec<&str> = labels
            .iter()
            .filter(|l| !self.y_labels.iter().any(|y| y == *l))
            .copied()
            .collect();
        if missing.is_empty() {
            return;
        }
        let old_rows = self.n_bins_y + 2;
        let width = self.n_bins_x + 2;
        let new_n_bins_y = self.n_bins_y + missing.len();
        let mut content = vec![0.0; (new_n_bins_y + 2) * width];
        let mut sumw2 = vec![0.0; (new_n_bins_y + 2) * width];
        // rows 0..=n_bins_y keep their place; the old overflow row moves last
        for iy in 0..old_rows - 1 {
            let src = iy * width;
            let dst = iy * width;
            content[dst..dst + width].copy_from_slice(&self.bin_content[src..src + width]);
            sumw2[dst..dst + width].copy_from_slice(&self.sumw2[src..src + width]);
        }
        let src = (old_rows - 1) * width;
        let dst = (new_n_bins_y + 1) * width;
        content[dst..dst + width].copy_from_slice(&self.bin_content[src..src + width]);
        sumw2[dst..dst + width].copy_from_slice(&self.sumw2[src..src + width]);
        self.n_bins_y = new_n_bins_y;
        self.y_max = new_n_bins_y as f64;
        self.bin_content = content;
        self.sumw2 = sumw2;
        self.y_labels.extend(missing.iter().map(|s| s.to_string()));
    }
}

/// The systematic-name-to-branches associative object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchMap {
    /// Object name.
    pub name: String,
    /// Systematic short name → underlying branch titles.
    pub map: BTreeMap<String, Vec<String>>,
}

/// A named object in a plots archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ArchiveObject {
    #[serde(rename = "histo1d")]
    Histo1D(Histo1D),
    #[serde(rename = "histo2d")]
    Histo2D(Histo2D),
    #[serde(rename = "branch_map")]
    BranchMap(BranchMap),
}

impl ArchiveObject {
    /// The object's name.
    pub fn name(&self) -> &str {
        match self {
            ArchiveObject::Histo1D(h) => &h.name,
            ArchiveObject::Histo2D(h) => &h.name,
            ArchiveObject::BranchMap(m) => &m.name,
        }
    }

    /// Rename in place.
    pub fn set_name(&mut self, name: String) {
        match self {
            ArchiveObject::Histo1D(h) => h.name = name,
            ArchiveObject::Histo2D(h) => h.name = name,
            ArchiveObject::BranchMap(m) => m.name = name,
        }
    }

    /// The `histo1D__`/`histo2D__`/`tmap__` prefix for this object class.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            ArchiveObject::Histo1D(_) => "histo1D",
            ArchiveObject::Histo2D(_) => "histo2D",
            ArchiveObject::BranchMap(_) => "tmap",
        }
    }
}

/// Strip a `histo1D__{sample}__` style prefix, returning the bare variable
/// name. Names without a prefix pass through unchanged.
pub fn deprefixed(name: &str) -> &str {
    match name.rfind("__") {
        Some(pos) => &name[pos + 2..],
        None => name,
    }
}

/// The `{sample}` segment of a prefixed object name, if present.
pub fn sample_of(name: &str) -> Option<&str> {
    let mut parts = name.split("__");
    let _prefix = parts.next()?;
    parts.next()
}

/// A plots archive: the on-disk collection of named objects for one piece
/// or one combined sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlotsArchive {
    pub objects: Vec<ArchiveObject>,
}

impl PlotsArchive {
    /// Read an archive from a JSON file.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::Config(format!("cannot open plots archive {}: {}", path.display(), e))
        })?;
        let archive = serde_json::from_reader(BufReader::new(file))?;
        Ok(archive)
    }

    /// Write the archive to a JSON file, objects sorted by name.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut sorted = self.clone();
        sorted.objects.sort_by(|a, b| a.name().cmp(b.name()));
        let file = File::create(path).map_err(|e| {
            Error::Config(format!("cannot create plots archive {}: {}", path.display(), e))
        })?;
        serde_json::to_writer(BufWriter::new(file), &sorted)?;
        Ok(())
    }

    /// Look up an object by exact name.
    pub fn get(&self, name: &str) -> Option<&ArchiveObject> {
        self.objects.iter().find(|o| o.name() == name)
    }

    /// Look up a 1-D histogram by exact name.
    pub fn get_histo1d(&self, name: &str) -> Option<&Histo1D> {
        match self.get(name) {
            Some(ArchiveObject::Histo1D(h)) => Some(h),
            _ => None,
        }
    }

    /// The content of bin 1 of a named scalar histogram (the convention for
    /// `SumOfWeights` and `LHEPdfSumw`).
    pub fn scalar_bin1(&self, name: &str) -> Option<f64> {
        self.get_histo1d(name).map(|h| h.bin_content[1])
    }

    /// All objects belonging to one sample of a combined archive, sorted by
    /// name.
    pub fn objects_for_sample(&self, sample: &str) -> Vec<&ArchiveObject> {
        let mut found: Vec<&ArchiveObject> = self
            .objects
            .iter()
            .filter(|o| sample_of(o.name()) == Some(sample))
            .collect();
        found.sort_by_key(|o| o.name().to_string());
        found
    }

    /// Add an object.
    pub fn push(&mut self, object: ArchiveObject) {
        self.objects.push(object);
    }
}

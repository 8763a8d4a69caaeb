//! Weighted selection-cut tables.
//!
//! A [`CutTable`] is the ordered per-selection-cut event-count summary for
//! one piece or composite sample. Row 0 is the "no cuts" row; merges are
//! position-aligned, so every accumulation first asserts that the ordered
//! cut-name sequences agree.
//!
//! Error fields carry a tagged [`Uncertainty`]: standard deviations on the
//! way in and out, accumulated variances while a table is being summed.
//! Calling an accumulation on an already-converted value is a loud
//! computation error, never a silent magnitude bug.

use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;

use hs_core::{Error, Result};
use tracing::{debug, warn};

use crate::archive::Histo1D;

/// A statistical uncertainty, tagged by representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Uncertainty {
    /// An unsquared uncertainty (what the `.dat` files carry).
    StdDev(f64),
    /// A running sum of squares, as held by an accumulating table.
    Variance(f64),
}

impl Uncertainty {
    /// Zero uncertainty in standard-deviation form.
    pub const ZERO: Uncertainty = Uncertainty::StdDev(0.0);

    /// The raw stored value, whatever its representation.
    pub fn value(self) -> f64 {
        match self {
            Uncertainty::StdDev(v) | Uncertainty::Variance(v) => v,
        }
    }

    fn expect_std_dev(self, context: &str) -> Result<f64> {
        match self {
            Uncertainty::StdDev(v) => Ok(v),
            Uncertainty::Variance(_) => Err(Error::Computation(format!(
                "{}: expected a standard-deviation uncertainty, found an accumulated variance",
                context
            ))),
        }
    }

    fn expect_variance(self, context: &str) -> Result<f64> {
        match self {
            Uncertainty::Variance(v) => Ok(v),
            Uncertainty::StdDev(_) => Err(Error::Computation(format!(
                "{}: expected an accumulated variance, found a standard deviation",
                context
            ))),
        }
    }
}

/// One selection-cut row.
#[derive(Debug, Clone)]
pub struct CutRow {
    pub variable_name: String,
    pub min1: String,
    pub max1: String,
    pub min2: String,
    pub max2: String,
    /// Event count before the cut.
    pub n: f64,
    pub err_n: Uncertainty,
    /// Event count passing the cut.
    pub n_pass: f64,
    pub err_n_pass: Uncertainty,
    pub eff_rel: f64,
    pub err_eff_rel: f64,
    pub eff_abs: f64,
    pub err_eff_abs: f64,
}

impl CutRow {
    /// A row with the given cut name and counts, zero errors, blank bounds.
    pub fn new(variable_name: &str, n: f64, n_pass: f64) -> Self {
        Self {
            variable_name: variable_name.to_string(),
            min1: "-".into(),
            max1: "-".into(),
            min2: "-".into(),
            max2: "-".into(),
            n,
            err_n: Uncertainty::ZERO,
            n_pass,
            err_n_pass: Uncertainty::ZERO,
            eff_rel: 0.0,
            err_eff_rel: 0.0,
            eff_abs: 0.0,
            err_eff_abs: 0.0,
        }
    }

    fn clear_efficiencies(&mut self) {
        self.eff_rel = 0.0;
        self.err_eff_rel = 0.0;
        self.eff_abs = 0.0;
        self.err_eff_abs = 0.0;
    }
}

/// Ordered selection-cut table for one piece or composite sample.
#[derive(Debug, Clone, Default)]
pub struct CutTable {
    pub rows: Vec<CutRow>,
}

impl CutTable {
    pub fn new(rows: Vec<CutRow>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Assert that `other` has the same ordered cut-name sequence.
    ///
    /// The merge is positional; combining tables from incompatible pipeline
    /// configurations must fail here rather than produce silently-wrong
    /// numbers.
    pub fn check_aligned(&self, other: &CutTable) -> Result<()> {
        if self.rows.len() != other.rows.len() {
            return Err(Error::Validation(format!(
                "cut tables are misaligned: {} rows vs {} rows",
                self.rows.len(),
                other.rows.len()
            )));
        }
        for (j, (a, b)) in self.rows.iter().zip(other.rows.iter()).enumerate() {
            if a.variable_name != b.variable_name {
                return Err(Error::Validation(format!(
                    "cut tables are misaligned at row {}: '{}' vs '{}'",
                    j, a.variable_name, b.variable_name
                )));
            }
        }
        Ok(())
    }

    /// Add `input` into this accumulator row by row.
    ///
    /// Counts add linearly; incoming standard deviations are squared into
    /// the accumulator's running variances. An empty accumulator becomes a
    /// copy of `input` with errors pre-squared.
    pub fn accumulate(&mut self, input: &CutTable) -> Result<()> {
        if self.rows.is_empty() {
            for row in &input.rows {
                let err_n = row.err_n.expect_std_dev(&ctx(row, "accumulate errN"))?;
                let err_n_pass =
                    row.err_n_pass.expect_std_dev(&ctx(row, "accumulate errNpass"))?;
                let mut new = row.clone();
                new.err_n = Uncertainty::Variance(err_n * err_n);
                new.err_n_pass = Uncertainty::Variance(err_n_pass * err_n_pass);
                new.clear_efficiencies();
                self.rows.push(new);
            }
            return Ok(());
        }
        self.check_aligned(input)?;
        for (acc, row) in self.rows.iter_mut().zip(input.rows.iter()) {
            let var_n = acc.err_n.expect_variance(&ctx(row, "accumulate errN"))?;
            let var_n_pass =
                acc.err_n_pass.expect_variance(&ctx(row, "accumulate errNpass"))?;
            let err_n = row.err_n.expect_std_dev(&ctx(row, "accumulate errN"))?;
            let err_n_pass = row.err_n_pass.expect_std_dev(&ctx(row, "accumulate errNpass"))?;
            acc.n += row.n;
            acc.n_pass += row.n_pass;
            acc.err_n = Uncertainty::Variance(var_n + err_n * err_n);
            acc.err_n_pass = Uncertainty::Variance(var_n_pass + err_n_pass * err_n_pass);
            acc.clear_efficiencies();
        }
        Ok(())
    }

    /// Subtract `input` from this table row by row.
    ///
    /// Variances of independent quantities add under subtraction, so the
    /// errors grow in quadrature. With `zero_negatives` a resulting negative
    /// count is floored to exactly 0.0: fake and background subtraction can
    /// statistically fluctuate negative.
    pub fn subtract(&mut self, input: &CutTable, zero_negatives: bool) -> Result<()> {
        if self.rows.is_empty() {
            return Err(Error::Computation(
                "cannot subtract from an empty table".into(),
            ));
        }
        self.check_aligned(input)?;
        for (out, row) in self.rows.iter_mut().zip(input.rows.iter()) {
            let err_out = out.err_n.expect_std_dev(&ctx(row, "subtract errN"))?;
            let err_in = row.err_n.expect_std_dev(&ctx(row, "subtract errN"))?;
            let err_pass_out = out.err_n_pass.expect_std_dev(&ctx(row, "subtract errNpass"))?;
            let err_pass_in = row.err_n_pass.expect_std_dev(&ctx(row, "subtract errNpass"))?;
            let mut new_n = out.n - row.n;
            let mut new_n_pass = out.n_pass - row.n_pass;
            if zero_negatives {
                if new_n < 0.0 {
                    new_n = 0.0;
                }
                if new_n_pass < 0.0 {
                    new_n_pass = 0.0;
                }
            }
            out.n = new_n;
            out.n_pass = new_n_pass;
            out.err_n = Uncertainty::StdDev((err_out * err_out + err_in * err_in).sqrt());
            out.err_n_pass =
                Uncertainty::StdDev((err_pass_out * err_pass_out + err_pass_in * err_pass_in).sqrt());
            out.clear_efficiencies();
        }
        Ok(())
    }

    /// Subtract `to_sub` with the fake-rate limiting safeguard.
    ///
    /// Any `to_sub` count whose magnitude exceeds `limit` times the
    /// corresponding count here is first clipped to
    /// `sign(to_sub) * limit * |count|`, so a statistically-noisy correction
    /// can never flip the sign of, or grossly exceed, the quantity it
    /// corrects. Clips at or beyond the `warn_after_cut` row are warned
    /// about; earlier ones are expected and applied silently.
    pub fn subtract_with_limit(
        &self,
        to_sub: &CutTable,
        zero_negatives: bool,
        limit: f64,
        warn_after_cut: &str,
    ) -> Result<CutTable> {
        if self.rows.is_empty() {
            return Err(Error::Computation(
                "cannot subtract from an empty table".into(),
            ));
        }
        self.check_aligned(to_sub)?;
        let mut output = self.clone();
        let mut beyond_warn_cut = false;
        for (out, sub) in output.rows.iter_mut().zip(to_sub.rows.iter()) {
            if sub.variable_name == warn_after_cut {
                beyond_warn_cut = true;
            }
            let err_out = out.err_n_pass.expect_std_dev(&ctx(sub, "limited subtract"))?;
            let err_in = sub.err_n_pass.expect_std_dev(&ctx(sub, "limited subtract"))?;
            let err_n_out = out.err_n.expect_std_dev(&ctx(sub, "limited subtract"))?;
            let err_n_in = sub.err_n.expect_std_dev(&ctx(sub, "limited subtract"))?;

            let mut sub_n_pass = sub.n_pass;
            if sub_n_pass.abs() > limit * out.n_pass.abs() {
                let clipped = sub_n_pass.signum() * limit * out.n_pass.abs();
                if beyond_warn_cut {
                    warn!(
                        cut = %sub.variable_name,
                        original = sub_n_pass,
                        clipped,
                        "limiting Npass subtraction to {:.0}% of the original yield",
                        limit * 100.0
                    );
                }
                sub_n_pass = clipped;
            }
            let mut sub_n = sub.n;
            if sub_n.abs() > limit * out.n.abs() {
                sub_n = sub_n.signum() * limit * out.n.abs();
            }

            let mut new_n = out.n - sub_n;
            let mut new_n_pass = out.n_pass - sub_n_pass;
            if zero_negatives {
                if new_n < 0.0 {
                    new_n = 0.0;
                }
                if new_n_pass < 0.0 {
                    new_n_pass = 0.0;
                }
            }
            out.n = new_n;
            out.n_pass = new_n_pass;
            out.err_n = Uncertainty::StdDev((err_n_out * err_n_out + err_n_in * err_n_in).sqrt());
            out.err_n_pass = Uncertainty::StdDev((err_out * err_out + err_in * err_in).sqrt());
            out.clear_efficiencies();
        }
        if !beyond_warn_cut {
            warn!(
                "did not find the cut '{}' in the table; warnings about limited subtractions \
                 have been suppressed",
                warn_after_cut
            );
        }
        Ok(output)
    }

    /// Scale counts by `scale_factor`, propagating relative errors in
    /// quadrature with the scale factor's own relative error.
    ///
    /// A zero original count contributes no relative-error term of its own
    /// (the scaled count is zero, so its error is the scale term alone,
    /// which also vanishes).
    pub fn scale(&mut self, scale_factor: f64, err_scale_factor: f64) -> Result<()> {
        if self.rows.is_empty() {
            return Err(Error::Computation("cannot scale an empty table".into()));
        }
        if scale_factor == 0.0 {
            return Err(Error::Computation(
                "cannot scale a table by exactly zero".into(),
            ));
        }
        let rel_scale = err_scale_factor / scale_factor;
        for row in &mut self.rows {
            let err_n = row.err_n.expect_std_dev(&ctx(row, "scale errN"))?;
            let err_n_pass = row.err_n_pass.expect_std_dev(&ctx(row, "scale errNpass"))?;
            let n_new = row.n * scale_factor;
            let err_n_new = if row.n > 0.0 {
                n_new * ((err_n / row.n).powi(2) + rel_scale * rel_scale).sqrt()
            } else {
                n_new * rel_scale
            };
            let n_pass_new = row.n_pass * scale_factor;
            let err_n_pass_new = if row.n_pass > 0.0 {
                n_pass_new * ((err_n_pass / row.n_pass).powi(2) + rel_scale * rel_scale).sqrt()
            } else {
                n_pass_new * rel_scale
            };
            row.n = n_new;
            row.err_n = Uncertainty::StdDev(err_n_new.abs());
            row.n_pass = n_pass_new;
            row.err_n_pass = Uncertainty::StdDev(err_n_pass_new.abs());
            row.clear_efficiencies();
        }
        Ok(())
    }

    /// Convert standard-deviation errors back into variances so a table that
    /// went through `subtract`/`scale` can enter [`CutTable::calculate_efficiency`].
    pub fn square_errors_for_efficiency(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Err(Error::Computation("cannot convert an empty table".into()));
        }
        for row in &mut self.rows {
            let err_n = row.err_n.expect_std_dev(&ctx(row, "square errN"))?;
            let err_n_pass = row.err_n_pass.expect_std_dev(&ctx(row, "square errNpass"))?;
            row.err_n = Uncertainty::Variance(err_n * err_n);
            row.err_n_pass = Uncertainty::Variance(err_n_pass * err_n_pass);
        }
        Ok(())
    }

    /// Terminal operation: convert accumulated variances to standard
    /// deviations and fill the relative/absolute efficiency columns.
    ///
    /// Row 0 is definitionally the theoretical total: efficiencies 1,
    /// errors 0.
    pub fn calculate_efficiency(&mut self) -> Result<()> {
        if self.rows.is_empty() {
            return Err(Error::Computation(
                "cannot calculate efficiencies of an empty table".into(),
            ));
        }
        let n0 = self.rows[0].n;
        for (j, row) in self.rows.iter_mut().enumerate() {
            if j == 0 {
                row.err_n = Uncertainty::StdDev(0.0);
                row.err_n_pass = Uncertainty::StdDev(0.0);
                row.eff_rel = 1.0;
                row.err_eff_rel = 0.0;
                row.eff_abs = 1.0;
                row.err_eff_abs = 0.0;
                continue;
            }
            let err_n = row.err_n.expect_variance(&ctx(row, "efficiency errN"))?.max(0.0).sqrt();
            let err_n_pass = row
                .err_n_pass
                .expect_variance(&ctx(row, "efficiency errNpass"))?
                .max(0.0)
                .sqrt();
            let rel_n = if row.n > 0.0 { err_n / row.n } else { 0.0 };
            let rel_n_pass = if row.n_pass > 0.0 { err_n_pass / row.n_pass } else { 0.0 };
            if row.n_pass > 0.0 && row.n > 0.0 {
                row.eff_rel = row.n_pass / row.n;
                row.err_eff_rel =
                    row.eff_rel * (rel_n_pass * rel_n_pass + rel_n * rel_n).sqrt();
                row.eff_abs = row.n_pass / n0;
                row.err_eff_abs = err_n_pass / n0;
            } else {
                row.eff_rel = 0.0;
                row.err_eff_rel = 0.0;
                row.eff_abs = 0.0;
                row.err_eff_abs = 0.0;
            }
            row.err_n = Uncertainty::StdDev(err_n);
            row.err_n_pass = Uncertainty::StdDev(err_n_pass);
        }
        Ok(())
    }

    /// Merge another variance-form accumulator into this one.
    ///
    /// Used at the piece boundary when one piece spans several input files:
    /// the per-file tables are first summed unweighted, then weighted once.
    pub fn merge_accumulated(&mut self, other: &CutTable) -> Result<()> {
        if self.rows.is_empty() {
            for row in &other.rows {
                row.err_n.expect_variance(&ctx(row, "merge errN"))?;
                row.err_n_pass.expect_variance(&ctx(row, "merge errNpass"))?;
                self.rows.push(row.clone());
            }
            return Ok(());
        }
        self.check_aligned(other)?;
        for (acc, row) in self.rows.iter_mut().zip(other.rows.iter()) {
            let var_n = acc.err_n.expect_variance(&ctx(row, "merge errN"))?;
            let var_n_pass = acc.err_n_pass.expect_variance(&ctx(row, "merge errNpass"))?;
            let in_var_n = row.err_n.expect_variance(&ctx(row, "merge errN"))?;
            let in_var_n_pass = row.err_n_pass.expect_variance(&ctx(row, "merge errNpass"))?;
            acc.n += row.n;
            acc.n_pass += row.n_pass;
            acc.err_n = Uncertainty::Variance(var_n + in_var_n);
            acc.err_n_pass = Uncertainty::Variance(var_n_pass + in_var_n_pass);
            acc.clear_efficiencies();
        }
        Ok(())
    }

    /// Apply the piece weight to a variance-form accumulator in place.
    ///
    /// Counts scale by `weight`, variances by `weight²`; row 0 is
    /// overridden with `xsec_times_lumi` exactly as in
    /// [`CutTable::create_weighted`].
    pub fn apply_weight_accumulated(
        &mut self,
        weight: f64,
        xsec_times_lumi: f64,
    ) -> Result<()> {
        if self.rows.is_empty() {
            return Err(Error::Computation("cannot weight an empty table".into()));
        }
        let w2 = weight * weight;
        for (j, row) in self.rows.iter_mut().enumerate() {
            if j == 0 {
                row.n = xsec_times_lumi;
                row.n_pass = xsec_times_lumi;
                row.err_n = Uncertainty::Variance(0.0);
                row.err_n_pass = Uncertainty::Variance(0.0);
                row.min1 = "-".into();
                row.max1 = "-".into();
                row.min2 = "-".into();
                row.max2 = "-".into();
                continue;
            }
            let var_n = row.err_n.expect_variance(&ctx(row, "weight errN"))?;
            let var_n_pass = row.err_n_pass.expect_variance(&ctx(row, "weight errNpass"))?;
            row.n *= weight;
            row.n_pass *= weight;
            row.err_n = Uncertainty::Variance(finite_or_zero(var_n * w2));
            row.err_n_pass = Uncertainty::Variance(finite_or_zero(var_n_pass * w2));
            row.clear_efficiencies();
        }
        Ok(())
    }

    /// Floor negative counts to zero (fake-rate inputs only; negative
    /// MC-weight fluctuations elsewhere are kept).
    pub fn zero_negative_yields(&mut self) {
        for row in &mut self.rows {
            if row.n < 0.0 {
                row.n = 0.0;
            }
            if row.n_pass < 0.0 {
                row.n_pass = 0.0;
            }
        }
    }

    /// Overlay authoritative per-row uncertainties from the
    /// `EventsPassingCuts` histogram of the companion plots archive.
    ///
    /// The `.dat` text alone does not carry trustworthy errors in every
    /// pipeline variant; the histogram's sum-of-weights-squared does. Row
    /// `j`'s `errNpass` is the histogram's √sumw2 at data bin `j+1`; its
    /// `errN` is row `j−1`'s overlaid `errNpass` (the cut-flow identity
    /// `N_j = Npass_{j−1}`).
    pub fn fill_errors_from(&mut self, hist: &Histo1D) -> Result<()> {
        if hist.n_bins < self.rows.len() {
            return Err(Error::Validation(format!(
                "histogram '{}' has {} bins but the table has {} rows",
                hist.name,
                hist.n_bins,
                self.rows.len()
            )));
        }
        let mut prev_err = 0.0;
        for (j, row) in self.rows.iter_mut().enumerate() {
            let err = hist.sumw2[j + 1].max(0.0).sqrt();
            row.err_n_pass = Uncertainty::StdDev(err);
            row.err_n = Uncertainty::StdDev(if j == 0 { err } else { prev_err });
            prev_err = err;
        }
        Ok(())
    }

    /// Weight-scaled copy of a per-piece table.
    ///
    /// Row 0 is overridden with `xsec_times_lumi`: that row is
    /// definitionally the theoretical total, independent of skimming. Every
    /// other row's counts and standard deviations scale linearly with
    /// `weight`; a non-finite scaled error collapses to zero.
    pub fn create_weighted(&self, weight: f64, xsec_times_lumi: f64) -> Result<CutTable> {
        let mut rows = Vec::with_capacity(self.rows.len());
        for (j, row) in self.rows.iter().enumerate() {
            if j == 0 {
                rows.push(CutRow::new(&row.variable_name, xsec_times_lumi, xsec_times_lumi));
                continue;
            }
            let err_n = row.err_n.expect_std_dev(&ctx(row, "weight errN"))?;
            let err_n_pass = row.err_n_pass.expect_std_dev(&ctx(row, "weight errNpass"))?;
            let mut new = row.clone();
            new.n = row.n * weight;
            new.n_pass = row.n_pass * weight;
            new.err_n = Uncertainty::StdDev(finite_or_zero(err_n * weight));
            new.err_n_pass = Uncertainty::StdDev(finite_or_zero(err_n_pass * weight));
            new.clear_efficiencies();
            rows.push(new);
        }
        Ok(CutTable::new(rows))
    }

    /// Write the table in the fixed-width `.dat` format, preceded by the
    /// sample name and the `#id` header line the downstream parser expects.
    pub fn write(&self, out: &mut dyn Write, name: &str) -> std::io::Result<()> {
        writeln!(out, "{}", name)?;
        let mut header = String::new();
        let _ = write!(header, "{:>4}", "#id");
        let _ = write!(header, " {:>25}", "variableName");
        for col in ["min1", "max1", "min2", "max2"] {
            let _ = write!(header, " {:>15}", col);
        }
        for col in ["N", "errN", "Npass", "errNpass"] {
            let _ = write!(header, " {:>17}", col);
        }
        for col in ["EffRel", "errEffRel", "EffAbs", "errEffAbs"] {
            let _ = write!(header, " {:>15}", col);
        }
        writeln!(out, "{}", header)?;
        for (j, row) in self.rows.iter().enumerate() {
            let mut line = String::new();
            let _ = write!(line, "{:>4}", j);
            let _ = write!(line, " {:>25}", row.variable_name);
            for field in [&row.min1, &row.max1, &row.min2, &row.max2] {
                let _ = write!(line, " {:>15}", field);
            }
            for value in [row.n, row.err_n.value(), row.n_pass, row.err_n_pass.value()] {
                let _ = write!(line, " {:>17}", format_count(value));
            }
            for value in [row.eff_rel, row.err_eff_rel, row.eff_abs, row.err_eff_abs] {
                let _ = write!(line, " {:>15}", format_count(value));
            }
            writeln!(out, "{}", line)?;
        }
        writeln!(out)?;
        debug!(sample = name, rows = self.rows.len(), "wrote cut table");
        Ok(())
    }
}

fn ctx(row: &CutRow, what: &str) -> String {
    format!("{} at cut '{}'", what, row.variable_name)
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Counts at or above 0.1 print as fixed-point, smaller ones in scientific
/// notation so tiny weighted yields keep their significant digits.
fn format_count(value: f64) -> String {
    if value >= 0.1 {
        format!("{:.4}", value)
    } else {
        format!("{:.4e}", value)
    }
}

/// Parse the first table of a `.dat` file.
pub fn parse_dat_file(path: &Path) -> Result<CutTable> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read table file {}: {}", path.display(), e)))?;
    parse_tables(&content)?
        .into_iter()
        .next()
        .map(|(_, table)| table)
        .ok_or_else(|| Error::Config(format!("no table found in {}", path.display())))
}

/// Parse the table for one named sample out of a multi-table `.dat` file.
pub fn parse_dat_file_for_sample(path: &Path, sample: &str) -> Result<CutTable> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read table file {}: {}", path.display(), e)))?;
    parse_tables(&content)?
        .into_iter()
        .find(|(name, _)| name.as_deref() == Some(sample))
        .map(|(_, table)| table)
        .ok_or_else(|| {
            Error::Config(format!("no table for sample '{}' in {}", sample, path.display()))
        })
}

/// Parse every `(sampleName, table)` pair in a `.dat` file.
///
/// A table starts at a `#id` header line; the nearest preceding non-blank
/// line names the sample. `###`-prefixed lines are comments.
pub fn parse_tables(content: &str) -> Result<Vec<(Option<String>, CutTable)>> {
    let mut tables: Vec<(Option<String>, CutTable)> = Vec::new();
    let mut columns: Vec<String> = Vec::new();
    let mut current: Option<(Option<String>, Vec<CutRow>)> = None;
    let mut prev_nonblank: Option<String> = None;

    for line in content.lines() {
        if line.starts_with("###") {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.starts_with("#id") {
            if let Some((name, rows)) = current.take() {
                tables.push((name, CutTable::new(rows)));
            }
            let name = prev_nonblank
                .as_ref()
                .and_then(|l| l.split_whitespace().last().map(|s| s.to_string()));
            columns = trimmed.split_whitespace().map(|s| s.to_string()).collect();
            current = Some((name, Vec::new()));
            continue;
        }
        if trimmed.is_empty() {
            if let Some((name, rows)) = current.take() {
                tables.push((name, CutTable::new(rows)));
            }
            continue;
        }
        if let Some((_, rows)) = current.as_mut() {
            rows.push(parse_row(trimmed, &columns)?);
        } else {
            prev_nonblank = Some(trimmed.to_string());
        }
    }
    if let Some((name, rows)) = current.take() {
        tables.push((name, CutTable::new(rows)));
    }
    Ok(tables)
}

fn parse_row(line: &str, columns: &[String]) -> Result<CutRow> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != columns.len() {
        return Err(Error::Config(format!(
            "table row has {} fields but the header has {}: \"{}\"",
            tokens.len(),
            columns.len(),
            line
        )));
    }
    let mut row = CutRow::new("", 0.0, 0.0);
    let mut have_n = false;
    for (i, (token, column)) in tokens.iter().zip(columns.iter()).enumerate().skip(1) {
        if i < 6 {
            match column.as_str() {
                "variableName" => row.variable_name = token.to_string(),
                "min1" => row.min1 = token.to_string(),
                "max1" => row.max1 = token.to_string(),
                "min2" => row.min2 = token.to_string(),
                "max2" => row.max2 = token.to_string(),
                other => {
                    return Err(Error::Config(format!(
                        "unexpected table column '{}'",
                        other
                    )))
                }
            }
            continue;
        }
        let value: f64 = token.parse().map_err(|_| {
            Error::Config(format!("bad numeric value '{}' in column '{}'", token, column))
        })?;
        match column.as_str() {
            "N" => {
                row.n = value;
                have_n = true;
            }
            "errN" => row.err_n = Uncertainty::StdDev(value),
            "Npass" => row.n_pass = value,
            "errNpass" => row.err_n_pass = Uncertainty::StdDev(value),
            "EffRel" => row.eff_rel = value,
            "errEffRel" => row.err_eff_rel = value,
            "EffAbs" => row.eff_abs = value,
            "errEffAbs" => row.err_eff_abs = value,
            other => {
                return Err(Error::Config(format!("unexpected table column '{}'", other)))
            }
        }
    }
    // older files carry only the Npass column pair
    if !have_n {
        row.n = row.n_pass;
        row.err_n = row.err_n_pass;
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fixture(counts: &[(&str, f64, f64, f64, f64)]) -> CutTable {
        CutTable::new(
            counts
                .iter()
                .map(|(name, n, err_n, n_pass, err_n_pass)| {
                    let mut row = CutRow::new(name, *n, *n_pass);
                    row.err_n = Uncertainty::StdDev(*err_n);
                    row.err_n_pass = Uncertainty::StdDev(*err_n_pass);
                    row
                })
                .collect(),
        )
    }

    #[test]
    fn test_accumulate_is_commutative() {
        let a = fixture(&[("NoCuts", 100.0, 0.0, 100.0, 0.0), ("Pt", 100.0, 3.0, 60.0, 2.0)]);
        let b = fixture(&[("NoCuts", 50.0, 0.0, 50.0, 0.0), ("Pt", 50.0, 1.0, 40.0, 1.5)]);

        let mut ab = CutTable::default();
        ab.accumulate(&a).unwrap();
        ab.accumulate(&b).unwrap();
        let mut ba = CutTable::default();
        ba.accumulate(&b).unwrap();
        ba.accumulate(&a).unwrap();

        for (x, y) in ab.rows.iter().zip(ba.rows.iter()) {
            assert_relative_eq!(x.n, y.n, max_relative = 1e-12);
            assert_relative_eq!(x.n_pass, y.n_pass, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_variance_accumulation_combines_in_quadrature() {
        let a = fixture(&[("NoCuts", 10.0, 0.0, 10.0, 0.0), ("Pt", 10.0, 3.0, 8.0, 3.0)]);
        let b = fixture(&[("NoCuts", 10.0, 0.0, 10.0, 0.0), ("Pt", 10.0, 4.0, 8.0, 4.0)]);
        let mut acc = CutTable::default();
        acc.accumulate(&a).unwrap();
        acc.accumulate(&b).unwrap();
        acc.calculate_efficiency().unwrap();
        // sqrt(3^2 + 4^2) = 5
        assert_relative_eq!(acc.rows[1].err_n_pass.value(), 5.0, max_relative = 1e-12);
    }

    #[test]
    fn test_accumulate_rejects_already_squared_input() {
        let a = fixture(&[("NoCuts", 10.0, 0.0, 10.0, 0.0)]);
        let mut acc = CutTable::default();
        acc.accumulate(&a).unwrap();
        // the accumulator now holds variances; feeding it back in must fail loudly
        let err = CutTable::default().accumulate(&acc).err();
        assert!(err.is_some());
        assert!(err.unwrap().to_string().contains("variance"));
    }

    #[test]
    fn test_misaligned_tables_are_rejected() {
        let a = fixture(&[("NoCuts", 10.0, 0.0, 10.0, 0.0), ("Pt", 10.0, 1.0, 5.0, 1.0)]);
        let b = fixture(&[("NoCuts", 10.0, 0.0, 10.0, 0.0), ("Eta", 10.0, 1.0, 5.0, 1.0)]);
        let mut acc = CutTable::default();
        acc.accumulate(&a).unwrap();
        let err = acc.accumulate(&b).unwrap_err();
        assert!(err.to_string().contains("Pt"));
        assert!(err.to_string().contains("Eta"));
    }

    #[test]
    fn test_subtract_floors_negatives_when_asked() {
        let mut out = fixture(&[("NoCuts", 10.0, 1.0, 8.0, 1.0)]);
        let sub = fixture(&[("NoCuts", 12.0, 1.0, 9.0, 1.0)]);
        out.subtract(&sub, true).unwrap();
        assert_eq!(out.rows[0].n, 0.0);
        assert_eq!(out.rows[0].n_pass, 0.0);

        let mut out = fixture(&[("NoCuts", 10.0, 1.0, 8.0, 1.0)]);
        out.subtract(&sub, false).unwrap();
        assert_relative_eq!(out.rows[0].n, -2.0);
    }

    #[test]
    fn test_subtract_with_limit_clips_to_half() {
        let base = fixture(&[
            ("PassIDRequirements", 10.0, 0.5, 10.0, 0.5),
            ("Pt", 10.0, 0.5, 10.0, 0.5),
        ]);
        let sub = fixture(&[
            ("PassIDRequirements", 1.0, 0.2, 1.0, 0.2),
            ("Pt", 8.0, 0.2, 8.0, 0.2),
        ]);
        let out = base
            .subtract_with_limit(&sub, false, 0.5, "PassIDRequirements")
            .unwrap();
        // |8| > 0.5*|10| so the subtraction is clipped to 5, never 8
        assert_relative_eq!(out.rows[1].n_pass, 5.0, max_relative = 1e-12);
        // the in-range row subtracts normally
        assert_relative_eq!(out.rows[0].n_pass, 9.0, max_relative = 1e-12);
    }

    #[test]
    fn test_subtract_with_limit_preserves_subtrahend_sign() {
        let base = fixture(&[("Pt", 10.0, 0.0, 10.0, 0.0)]);
        let sub = fixture(&[("Pt", -8.0, 0.0, -8.0, 0.0)]);
        let out = base.subtract_with_limit(&sub, false, 0.5, "Pt").unwrap();
        // clip to sign(-8) * 0.5 * |10| = -5, result 10 - (-5) = 15
        assert_relative_eq!(out.rows[0].n_pass, 15.0, max_relative = 1e-12);
    }

    #[test]
    fn test_scale_propagates_relative_errors() {
        let mut table = fixture(&[("Pt", 100.0, 10.0, 50.0, 5.0)]);
        table.scale(2.0, 0.0).unwrap();
        assert_relative_eq!(table.rows[0].n, 200.0);
        assert_relative_eq!(table.rows[0].err_n.value(), 20.0, max_relative = 1e-12);
        assert_relative_eq!(table.rows[0].n_pass, 100.0);
        assert_relative_eq!(table.rows[0].err_n_pass.value(), 10.0, max_relative = 1e-12);
    }

    #[test]
    fn test_scale_zero_count_uses_scale_term_only() {
        let mut table = fixture(&[("Pt", 0.0, 0.0, 0.0, 0.0)]);
        table.scale(0.5, 0.1).unwrap();
        assert_eq!(table.rows[0].n, 0.0);
        assert_eq!(table.rows[0].err_n.value(), 0.0);
    }

    #[test]
    fn test_scale_by_zero_is_fatal() {
        let mut table = fixture(&[("Pt", 1.0, 0.1, 1.0, 0.1)]);
        assert!(table.scale(0.0, 0.0).is_err());
    }

    #[test]
    fn test_efficiency_fixture_monotonic_eff_abs() {
        let a = fixture(&[
            ("NoCuts", 100.0, 0.0, 100.0, 0.0),
            ("Pt", 100.0, 2.0, 80.0, 2.0),
            ("Eta", 80.0, 2.0, 50.0, 1.5),
            ("Mass", 50.0, 1.5, 20.0, 1.0),
        ]);
        let mut acc = CutTable::default();
        acc.accumulate(&a).unwrap();
        acc.calculate_efficiency().unwrap();
        assert_eq!(acc.rows[0].eff_rel, 1.0);
        assert_eq!(acc.rows[0].eff_abs, 1.0);
        let mut prev = f64::INFINITY;
        for row in &acc.rows {
            assert!(row.eff_abs <= prev);
            prev = row.eff_abs;
        }
        assert_relative_eq!(acc.rows[1].eff_rel, 0.8, max_relative = 1e-12);
        assert_relative_eq!(acc.rows[3].eff_abs, 0.2, max_relative = 1e-12);
    }

    #[test]
    fn test_create_weighted_overrides_row_zero() {
        let data = fixture(&[("NoCuts", 100.0, 0.0, 100.0, 0.0), ("Pt", 100.0, 2.0, 60.0, 2.0)]);
        let weighted = data.create_weighted(0.4, 20.0).unwrap();
        assert_relative_eq!(weighted.rows[0].n, 20.0);
        assert_relative_eq!(weighted.rows[0].n_pass, 20.0);
        assert_relative_eq!(weighted.rows[1].n_pass, 24.0, max_relative = 1e-12);
        assert_relative_eq!(weighted.rows[1].err_n_pass.value(), 0.8, max_relative = 1e-12);
    }

    #[test]
    fn test_multi_file_piece_weighting_matches_single_file_path() {
        // two files of one piece, summed unweighted then weighted once,
        // must equal the single-file weighted path on the combined counts
        let file_a = fixture(&[("NoCuts", 60.0, 0.0, 60.0, 0.0), ("Pt", 60.0, 3.0, 30.0, 3.0)]);
        let file_b = fixture(&[("NoCuts", 40.0, 0.0, 40.0, 0.0), ("Pt", 40.0, 4.0, 20.0, 4.0)]);
        let mut piece = CutTable::default();
        piece.accumulate(&file_a).unwrap();
        piece.accumulate(&file_b).unwrap();
        piece.apply_weight_accumulated(0.5, 20.0).unwrap();
        assert_relative_eq!(piece.rows[0].n_pass, 20.0);
        assert_relative_eq!(piece.rows[1].n_pass, 25.0, max_relative = 1e-12);
        // variance (9 + 16) * 0.25
        assert_relative_eq!(piece.rows[1].err_n_pass.value(), 6.25, max_relative = 1e-12);

        let mut sample = CutTable::default();
        sample.merge_accumulated(&piece).unwrap();
        sample.calculate_efficiency().unwrap();
        assert_relative_eq!(sample.rows[1].err_n_pass.value(), 2.5, max_relative = 1e-12);
    }

    #[test]
    fn test_write_parse_round_trip() {
        let a = fixture(&[("NoCuts", 100.0, 0.0, 100.0, 0.0), ("Pt", 100.0, 2.0, 60.0, 2.0)]);
        let mut acc = CutTable::default();
        acc.accumulate(&a).unwrap();
        acc.calculate_efficiency().unwrap();

        let mut buf: Vec<u8> = Vec::new();
        acc.write(&mut buf, "TTbar").unwrap();
        let text = String::from_utf8(buf).unwrap();
        let parsed = parse_tables(&text).unwrap();
        assert_eq!(parsed.len(), 1);
        let (name, table) = &parsed[0];
        assert_eq!(name.as_deref(), Some("TTbar"));
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].variable_name, "Pt");
        assert_relative_eq!(table.rows[1].n_pass, 60.0, max_relative = 1e-6);
    }

    #[test]
    fn test_fill_errors_from_histogram() {
        let mut hist = Histo1D::new("EventsPassingCuts", 2, 0.0, 2.0);
        hist.bin_content[1] = 100.0;
        hist.sumw2[1] = 9.0;
        hist.bin_content[2] = 60.0;
        hist.sumw2[2] = 4.0;
        let mut table =
            fixture(&[("NoCuts", 100.0, 0.0, 100.0, 0.0), ("Pt", 100.0, 0.0, 60.0, 0.0)]);
        table.fill_errors_from(&hist).unwrap();
        assert_relative_eq!(table.rows[0].err_n_pass.value(), 3.0);
        assert_relative_eq!(table.rows[1].err_n_pass.value(), 2.0);
        // errN of row 1 is row 0's overlaid errNpass
        assert_relative_eq!(table.rows[1].err_n.value(), 3.0);
    }
}

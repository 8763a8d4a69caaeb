//! Data-driven QCD fake-rate yield: 1FR − DY-in-1FR − 2FR.
//!
//! The 2-fake-rate region corrects the single-fake-rate estimate for
//! double-counted fake contributions, but it is statistically noisy; before
//! subtracting, any 2FR bin larger in magnitude than half the quantity it
//! corrects is clipped to exactly that half, so the correction can never
//! flip the sign of the estimate. The QCD estimate is meaningless before
//! the fake rate and the object selection have been applied, so clips at
//! cuts earlier than `warn_after_cut` are applied silently.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use hs_core::{Error, Result};
use tracing::{debug, info, warn};

use crate::archive::{deprefixed, ArchiveObject, Histo1D, Histo2D, PlotsArchive};
use crate::table;

/// Tuning of the QCD subtraction.
#[derive(Debug, Clone)]
pub struct QcdConfig {
    /// Sample holding the data-driven QCD estimate in both regions.
    pub qcd_sample: String,
    /// Monte-Carlo sample for the Drell-Yan contamination of the 1FR region.
    pub zjet_sample: String,
    /// Maximum allowed |2FR| as a fraction of |1FR − DY| per bin.
    pub limit: f64,
    /// Selection name from which on clip warnings are emitted. The stage
    /// name is analysis-specific, so it is configuration, not a constant.
    pub warn_after_cut: String,
}

impl Default for QcdConfig {
    fn default() -> Self {
        Self {
            qcd_sample: "QCDFakes_DATA".into(),
            zjet_sample: "ZJet_amcatnlo_ptBinned_IncStitch".into(),
            limit: 0.5,
            warn_after_cut: "PassIDRequirements".into(),
        }
    }
}

/// Inputs and outputs of one QCD-yield run.
#[derive(Debug, Clone)]
pub struct QcdYieldOptions {
    /// Directory with the single-fake-rate estimate's plots/tables pair.
    pub single_fr_dir: PathBuf,
    /// Directory with the double-fake-rate estimate's plots/tables pair.
    pub double_fr_dir: PathBuf,
    /// Output directory (created if missing).
    pub output_dir: PathBuf,
    /// Output plots file name; the tables name is derived from it.
    pub file_name: String,
    pub config: QcdConfig,
}

impl QcdYieldOptions {
    pub fn new(single_fr_dir: PathBuf, double_fr_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            single_fr_dir,
            double_fr_dir,
            output_dir,
            file_name: "qcdSubtracted_plots.json".into(),
            config: QcdConfig::default(),
        }
    }
}

/// Find exactly one file in `dir` whose name ends with `suffix`.
pub fn find_unique_file(dir: &Path, suffix: &str) -> Result<PathBuf> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read directory {}: {}", dir.display(), e)))?;
    let mut found: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(suffix) {
            found.push(entry.path());
        }
    }
    if found.len() != 1 {
        return Err(Error::Config(format!(
            "could not find unique file ending with '{}' in dir {}; found {} instead: {:?}",
            suffix,
            dir.display(),
            found.len(),
            found
        )));
    }
    Ok(found.remove(0))
}

fn clip_bin(
    single: f64,
    double_fr: f64,
    limit: f64,
    beyond_warn_cut: bool,
    name: &str,
    bin: usize,
) -> f64 {
    if double_fr.abs() > limit * single.abs() {
        let clipped = double_fr.signum() * limit * single.abs();
        if beyond_warn_cut {
            warn!(
                hist = name,
                bin,
                original = double_fr,
                clipped,
                "limiting 2FR bin to {:.0}% of the 1FR content",
                limit * 100.0
            );
        } else {
            debug!(hist = name, bin, original = double_fr, clipped, "limited 2FR bin");
        }
        clipped
    } else {
        double_fr
    }
}

/// Subtract a 2FR histogram from a 1FR-minus-DY histogram with the
/// per-bin clip safeguard.
pub fn subtract_with_limit_1d(
    single: &mut Histo1D,
    double_fr: &Histo1D,
    cfg: &QcdConfig,
) -> Result<()> {
    let warn_from = single.find_label_bin(&cfg.warn_after_cut);
    let mut clipped = double_fr.clone();
    for bin in 0..single.n_cells().min(clipped.n_cells()) {
        let beyond = warn_from.map_or(false, |w| bin >= w);
        clipped.bin_content[bin] = clip_bin(
            single.bin_content[bin],
            clipped.bin_content[bin],
            cfg.limit,
            beyond,
            &single.name,
            bin,
        );
    }
    single.add_scaled(&clipped, -1.0)
}

/// 2-D counterpart of [`subtract_with_limit_1d`]; the warn stage is keyed
/// on the x (selection) axis.
pub fn subtract_with_limit_2d(
    single: &mut Histo2D,
    double_fr: &Histo2D,
    cfg: &QcdConfig,
) -> Result<()> {
    let warn_from = single.find_x_label_bin(&cfg.warn_after_cut);
    let width = single.n_bins_x + 2;
    let mut clipped = double_fr.clone();
    for cell in 0..single.bin_content.len().min(clipped.bin_content.len()) {
        let ix = cell % width;
        let beyond = warn_from.map_or(false, |w| ix >= w);
        clipped.bin_content[cell] = clip_bin(
            single.bin_content[cell],
            clipped.bin_content[cell],
            cfg.limit,
            beyond,
            &single.name,
            cell,
        );
    }
    single.add_scaled(&clipped, -1.0)
}

/// Produce the subtracted QCD histograms from the three aligned object
/// lists (1FR QCD, 2FR QCD, DY in 1FR).
///
/// The lists come sorted by name from the combined archives and must agree
/// object by object; `LHEPdfSum` bookkeeping histograms are skipped.
pub fn subtract_sample_histos(
    single_fr: &[&ArchiveObject],
    double_fr: &[&ArchiveObject],
    dyj_single_fr: &[&ArchiveObject],
    cfg: &QcdConfig,
) -> Result<Vec<ArchiveObject>> {
    if single_fr.len() != double_fr.len() || single_fr.len() != dyj_single_fr.len() {
        return Err(Error::Validation(format!(
            "histogram lists differ in length: 1FR has {}, 2FR has {}, DY has {}",
            single_fr.len(),
            double_fr.len(),
            dyj_single_fr.len()
        )));
    }
    let mut subtracted = Vec::new();
    for ((single, double_fr), dyj) in
        single_fr.iter().zip(double_fr.iter()).zip(dyj_single_fr.iter())
    {
        let suffix = deprefixed(single.name());
        if suffix.contains("LHEPdfSum") {
            continue;
        }
        for (other, which) in [(double_fr, "2FR"), (dyj, "DY")] {
            if deprefixed(other.name()) != suffix {
                return Err(Error::Validation(format!(
                    "histogram names do not match between 1FR and {}: {} vs {}",
                    which,
                    single.name(),
                    other.name()
                )));
            }
        }
        match (single, double_fr, dyj) {
            (
                ArchiveObject::Histo1D(s),
                ArchiveObject::Histo1D(d),
                ArchiveObject::Histo1D(z),
            ) => {
                let mut result = s.clone();
                result.add_scaled(z, -1.0)?;
                subtract_with_limit_1d(&mut result, d, cfg)?;
                result.zero_negative_bins();
                subtracted.push(ArchiveObject::Histo1D(result));
            }
            (
                ArchiveObject::Histo2D(s),
                ArchiveObject::Histo2D(d),
                ArchiveObject::Histo2D(z),
            ) => {
                let mut result = s.clone();
                result.add_scaled(z, -1.0)?;
                subtract_with_limit_2d(&mut result, d, cfg)?;
                result.zero_negative_bins();
                subtracted.push(ArchiveObject::Histo2D(result));
            }
            (ArchiveObject::BranchMap(m), _, _) => {
                subtracted.push(ArchiveObject::BranchMap(m.clone()));
            }
            _ => {
                return Err(Error::Validation(format!(
                    "object classes do not match across regions for '{}'",
                    single.name()
                )));
            }
        }
    }
    Ok(subtracted)
}

/// Run the full QCD-yield step: locate the two estimates' plots/tables
/// pairs, subtract, and write the combined outputs.
pub fn run_qcd_yield(opts: &QcdYieldOptions) -> Result<()> {
    let cfg = &opts.config;
    info!(
        zjet = %cfg.zjet_sample,
        qcd = %cfg.qcd_sample,
        "subtracting DY and 2FR contributions from the 1FR QCD estimate"
    );

    let single_plots = find_unique_file(&opts.single_fr_dir, "_plots.json")?;
    let single_tables = find_unique_file(&opts.single_fr_dir, "_tables.dat")?;
    let double_plots = find_unique_file(&opts.double_fr_dir, "_plots.json")?;
    let double_tables = find_unique_file(&opts.double_fr_dir, "_tables.dat")?;

    let single_archive = PlotsArchive::read(&single_plots)?;
    let double_archive = PlotsArchive::read(&double_plots)?;
    let single_qcd = sample_objects(&single_archive, &cfg.qcd_sample, &single_plots)?;
    let single_dyj = sample_objects(&single_archive, &cfg.zjet_sample, &single_plots)?;
    let double_qcd = sample_objects(&double_archive, &cfg.qcd_sample, &double_plots)?;

    let subtracted = subtract_sample_histos(&single_qcd, &double_qcd, &single_dyj, cfg)?;

    let single_table = table::parse_dat_file_for_sample(&single_tables, &cfg.qcd_sample)?;
    let orig_dyj_table = table::parse_dat_file_for_sample(&single_tables, &cfg.zjet_sample)?;
    let mut dyj_table = orig_dyj_table.clone();
    // remove the x1000 from the MC table
    dyj_table.scale(1.0 / 1000.0, 0.0)?;
    let double_table = table::parse_dat_file_for_sample(&double_tables, &cfg.qcd_sample)?;

    let mut single_no_dyj = single_table.clone();
    single_no_dyj.subtract(&dyj_table, false)?;
    let final_table =
        single_no_dyj.subtract_with_limit(&double_table, true, cfg.limit, &cfg.warn_after_cut)?;

    if !opts.output_dir.is_dir() {
        fs::create_dir_all(&opts.output_dir).map_err(|e| {
            Error::Config(format!(
                "cannot create output directory {}: {}",
                opts.output_dir.display(),
                e
            ))
        })?;
    }
    let plots_path = opts.output_dir.join(&opts.file_name);
    let mut archive = PlotsArchive::default();
    for object in subtracted {
        archive.push(object);
    }
    archive.write(&plots_path)?;
    info!(path = %plots_path.display(), "wrote subtracted plots");

    let tables_name = opts.file_name.replace("_plots.json", "_tables.dat");
    let tables_path = opts.output_dir.join(tables_name);
    let file = File::create(&tables_path).map_err(|e| {
        Error::Config(format!("cannot create {}: {}", tables_path.display(), e))
    })?;
    let mut out = BufWriter::new(file);
    single_table.write(&mut out, "1FR")?;
    orig_dyj_table.write(&mut out, "DYJ1FR")?;
    single_no_dyj.write(&mut out, "1FR-DYJ1FR")?;
    double_table.write(&mut out, "2FR")?;
    final_table.write(&mut out, &cfg.qcd_sample)?;
    out.flush()?;
    info!(path = %tables_path.display(), "wrote subtracted tables");
    Ok(())
}

fn sample_objects<'a>(
    archive: &'a PlotsArchive,
    sample: &str,
    path: &Path,
) -> Result<Vec<&'a ArchiveObject>> {
    let objects = archive.objects_for_sample(sample);
    if objects.is_empty() {
        return Err(Error::Config(format!(
            "failed to read any histograms for sample '{}' from {}",
            sample,
            path.display()
        )));
    }
    info!(sample, count = objects.len(), file = %path.display(), "found sample histograms");
    Ok(objects)
}

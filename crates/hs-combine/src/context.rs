//! Orchestration of a combination run.
//!
//! [`CombinationContext`] owns everything a run needs (the parsed
//! cross-section table, the sample definitions, and the located per-piece
//! input files) and is built once by the driver. Component functions
//! borrow it for the duration of one call; there is no module-global state.
//!
//! Independent composite samples are farmed out to a small, explicitly
//! capped worker pool; within one sample the accumulation loop is strictly
//! sequential (its result is order-independent, its diagnostics are not).

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use hs_core::{Error, Result};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::aggregate::HistoStore;
use crate::archive::PlotsArchive;
use crate::samples::SampleDefinitions;
use crate::table::{self, CutTable};
use crate::validate;
use crate::weight;
use crate::xsection::{self, XsectionTable};

/// Settings of the ttbar-from-data background prediction (`-b` mode).
#[derive(Debug, Clone)]
pub struct TtbarBkgConfig {
    /// Raw ttbar-enriched data composite.
    pub raw_data_sample: String,
    /// Non-ttbar MC composite subtracted from it.
    pub non_ttbar_bkg_sample: String,
    /// Name of the emitted prediction.
    pub prediction_name: String,
    /// R(ee, eμ) transfer factor and its uncertainty.
    pub r_factor: f64,
    pub err_r_factor: f64,
}

impl Default for TtbarBkgConfig {
    fn default() -> Self {
        Self {
            raw_data_sample: "TTBarUnscaledRawFromDATA".into(),
            non_ttbar_bkg_sample: "NONTTBARBKG_amcatnloPt_amcAtNLODiboson_emujj".into(),
            prediction_name: "TTBarFromDATA".into(),
            r_factor: 0.418559,
            err_r_factor: 0.002474,
        }
    }
}

/// Settings of the QCD closure test (`-q` mode).
#[derive(Debug, Clone)]
pub struct QcdClosureConfig {
    /// Data composite observed in the closure region.
    pub data_sample: String,
    /// Summed non-QCD MC composite subtracted from it.
    pub non_qcd_bkg_sample: String,
    /// Name of the emitted observation.
    pub closure_name: String,
}

impl Default for QcdClosureConfig {
    fn default() -> Self {
        Self {
            data_sample: "SinglePhoton_all".into(),
            non_qcd_bkg_sample: "ALLBKG_powhegTTBar_ZJetWJetPt_amcAtNLODiboson".into(),
            closure_name: "QCDClosureObserved".into(),
        }
    }
}

/// Options of one combination run.
#[derive(Debug, Clone)]
pub struct CombineOptions {
    /// List of all datasets to be used.
    pub input_list: PathBuf,
    /// Analysis code name: the beginning of the input file names before `___`.
    pub analysis_code: String,
    /// Directory containing the per-piece plots/tables files.
    pub input_dir: PathBuf,
    /// Integrated luminosity in pb^-1 that results are rescaled to.
    pub int_lumi: f64,
    /// Cross-section file (pb; `-1` for data).
    pub xsection_file: PathBuf,
    /// Output directory.
    pub output_dir: PathBuf,
    /// Samples-to-combine file.
    pub sample_list: PathBuf,
    /// Only combine tables, skip histograms.
    pub tables_only: bool,
    /// Treat the same LHE variation index as correlated across the pieces
    /// of a composite sample.
    pub correlate_lhe_systematics: bool,
    /// Run the ttbar-from-data background prediction after combining.
    pub ttbar_bkg: Option<TtbarBkgConfig>,
    /// Run the QCD closure test after combining.
    pub qcd_closure: Option<QcdClosureConfig>,
    /// Worker-pool cap for the per-sample fan-out.
    pub threads: usize,
}

impl CombineOptions {
    /// Options with the conventional defaults for the given paths.
    pub fn new(
        input_list: PathBuf,
        analysis_code: String,
        input_dir: PathBuf,
        int_lumi: f64,
        xsection_file: PathBuf,
        output_dir: PathBuf,
        sample_list: PathBuf,
    ) -> Self {
        Self {
            input_list,
            analysis_code,
            input_dir,
            int_lumi,
            xsection_file,
            output_dir,
            sample_list,
            tables_only: false,
            correlate_lhe_systematics: false,
            ttbar_bkg: None,
            qcd_closure: None,
            threads: 4,
        }
    }
}

/// The located input files of one piece.
#[derive(Debug, Clone)]
struct PieceFiles {
    plots: PathBuf,
    tables: PathBuf,
}

/// One fully-combined composite sample, ready to write.
#[derive(Debug, Clone)]
pub struct CombinedSample {
    pub name: String,
    pub table: CutTable,
    pub histos: HistoStore,
}

/// All state of one combination run.
#[derive(Debug)]
pub struct CombinationContext {
    opts: CombineOptions,
    xsections: XsectionTable,
    samples: SampleDefinitions,
    /// Canonical piece name → located input file pairs. Distinct raw
    /// dataset names that sanitize to the same piece are the same physical
    /// dataset split across files; all of them are combined.
    piece_files: BTreeMap<String, Vec<PieceFiles>>,
}

impl CombinationContext {
    /// Parse the configuration files, verify that every input dataset has a
    /// cross-section, and locate every piece's plots/tables pair on disk.
    pub fn initialize(opts: CombineOptions) -> Result<Self> {
        for (what, path) in [
            ("sample list", &opts.sample_list),
            ("cross-section file", &opts.xsection_file),
            ("input list", &opts.input_list),
        ] {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "{} {} not found",
                    what,
                    path.display()
                )));
            }
        }
        let xsections = XsectionTable::parse(&opts.xsection_file)?;
        let samples = SampleDefinitions::parse(&opts.sample_list)?;

        let content = fs::read_to_string(&opts.input_list)?;
        let mut piece_files = BTreeMap::new();
        let mut missing: Vec<String> = Vec::new();
        for line in content.lines() {
            if line.starts_with('#') {
                continue;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let dataset = dataset_from_input_line(line);
            // every dataset in the input list must have a cross-section,
            // even if no sample uses it in this run
            let piece = crate::dataset::sanitize_from_input_list(&dataset);
            xsections.lookup(&piece)?;
            match locate_piece_files(&opts, &dataset) {
                Some(files) => {
                    piece_files.entry(piece).or_insert_with(Vec::new).push(files);
                }
                None => missing.push(dataset),
            }
        }
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "could not find plots/tables files for datasets: {:?}; exiting",
                missing
            )));
        }
        info!(
            pieces = piece_files.len(),
            xsections = xsections.len(),
            "all input files are present"
        );
        Ok(Self { opts, xsections, samples, piece_files })
    }

    /// The run options.
    pub fn options(&self) -> &CombineOptions {
        &self.opts
    }

    /// Composite sample names, in sample-list order.
    pub fn sample_names(&self) -> Vec<String> {
        self.samples.names().map(|s| s.to_string()).collect()
    }

    /// Combine one composite sample: accumulate every expected piece's
    /// table and histograms, validate completeness, and finalize.
    pub fn combine_sample(&self, sample: &str) -> Result<CombinedSample> {
        let pieces_to_add = self.samples.expand_sample(sample)?;
        info!(sample, pieces = pieces_to_add.len(), "combining sample");
        let is_qcd = sample.to_ascii_lowercase().contains("qcd");

        let mut sample_table = CutTable::default();
        let mut histos = HistoStore::new();
        let mut pieces_added: BTreeSet<String> = BTreeSet::new();

        for piece in &pieces_to_add {
            let Some(files) = self.piece_files.get(piece) else {
                warn!(sample, piece, "no input file found for piece");
                continue;
            };
            let xsection_val = self.xsections.lookup(piece)?;
            let is_data = xsection::is_data(xsection_val);

            // the files of one piece are one physical dataset split up:
            // sum their raw tables, histograms, and generator-weight sums,
            // then weight the piece once
            let mut piece_table = CutTable::default();
            let mut piece_histos = HistoStore::new();
            let mut n_tot = 0.0;
            let mut sum_weights = 0.0;
            let mut lhe_pdf_sumw = 0.0;
            for file in files {
                info!(sample, piece, file = %file.plots.display(), "found matching dataset");
                let archive = PlotsArchive::read(&file.plots)?;
                let mut data = table::parse_dat_file(&file.tables)?;
                if data.is_empty() {
                    return Err(Error::Config(format!(
                        "empty cut table in {}",
                        file.tables.display()
                    )));
                }
                match archive.scalar_bin1("SumOfWeights") {
                    Some(v) => sum_weights += v,
                    None if is_data => {}
                    None => {
                        return Err(Error::Config(format!(
                            "no SumOfWeights histogram in {}",
                            file.plots.display()
                        )))
                    }
                }
                lhe_pdf_sumw += archive.scalar_bin1("LHEPdfSumw").unwrap_or(0.0);
                n_tot += data.rows[0].n_pass;
                if let Some(hist) = archive.get_histo1d("EventsPassingCuts") {
                    data.fill_errors_from(hist)?;
                }
                piece_table.accumulate(&data)?;
                if !self.opts.tables_only {
                    // the same LHE variation index is the same weight
                    // across files of one dataset: raw rows just sum here
                    piece_histos.update_from(&archive.objects, piece, 1.0, true, is_data, is_qcd)?;
                }
            }

            let piece_weight = weight::calculate_weight(
                n_tot,
                xsection_val,
                self.opts.int_lumi,
                sum_weights,
                lhe_pdf_sumw,
                false,
                piece,
            )?;
            piece_table
                .apply_weight_accumulated(piece_weight.weight, piece_weight.xsec_times_lumi)?;
            if is_qcd {
                piece_table.zero_negative_yields();
            }
            sample_table.merge_accumulated(&piece_table)?;

            if !self.opts.tables_only {
                histos.update_from(
                    &piece_histos.into_object_vec(),
                    piece,
                    piece_weight.plot_weight,
                    self.opts.correlate_lhe_systematics,
                    is_data,
                    is_qcd,
                )?;
            }
            pieces_added.insert(piece.clone());
        }

        validate::check_pieces_added(sample, &pieces_added, &pieces_to_add)?;
        if !self.opts.tables_only {
            histos.finalize_systematics(self.opts.correlate_lhe_systematics)?;
        }
        sample_table.calculate_efficiency()?;
        Ok(CombinedSample { name: sample.to_string(), table: sample_table, histos })
    }

    /// Write one combined sample's plots/tables pair, returning the paths.
    pub fn write_sample_outputs(&self, combined: &CombinedSample) -> Result<(PathBuf, PathBuf)> {
        let dat_path = self
            .opts
            .output_dir
            .join(format!("{}_{}_tables.dat", self.opts.analysis_code, combined.name));
        let file = File::create(&dat_path).map_err(|e| {
            Error::Config(format!("cannot create {}: {}", dat_path.display(), e))
        })?;
        let mut out = BufWriter::new(file);
        combined.table.write(&mut out, &combined.name)?;
        out.flush()?;

        let plots_path = self
            .opts
            .output_dir
            .join(format!("{}_{}_plots.json", self.opts.analysis_code, combined.name));
        if !self.opts.tables_only {
            combined.histos.to_archive(&combined.name).write(&plots_path)?;
        }
        Ok((plots_path, dat_path))
    }

    /// Run the whole combination: every sample in the sample list, the
    /// combined tables file, and the special background-subtraction modes.
    pub fn run(&self) -> Result<()> {
        fs::create_dir_all(&self.opts.output_dir).map_err(|e| {
            Error::Config(format!(
                "cannot create output directory {}: {}",
                self.opts.output_dir.display(),
                e
            ))
        })?;

        let names = self.sample_names();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.threads.max(1))
            .build()
            .map_err(|e| Error::Computation(format!("cannot build worker pool: {}", e)))?;
        let combined: Vec<CombinedSample> = pool.install(|| {
            names
                .par_iter()
                .map(|name| self.combine_sample(name))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut tables: BTreeMap<String, CombinedSample> = BTreeMap::new();
        for sample in &combined {
            self.write_sample_outputs(sample)?;
        }

        let tables_path = self
            .opts
            .output_dir
            .join(format!("{}_tables.dat", self.opts.analysis_code));
        let file = File::create(&tables_path).map_err(|e| {
            Error::Config(format!("cannot create {}: {}", tables_path.display(), e))
        })?;
        let mut out = BufWriter::new(file);
        for sample in combined {
            sample.table.write(&mut out, &sample.name)?;
            tables.insert(sample.name.clone(), sample);
        }

        if let Some(cfg) = &self.opts.ttbar_bkg {
            self.run_ttbar_bkg(cfg, &tables, &mut out)?;
        }
        if let Some(cfg) = &self.opts.qcd_closure {
            self.run_qcd_closure(cfg, &tables, &mut out)?;
        }
        out.flush()?;
        info!(path = %tables_path.display(), "wrote combined tables");
        Ok(())
    }

    /// ttbar-from-data: subtract the non-ttbar MC composite from the raw
    /// ttbar data composite, scale by the R factor, and emit the prediction.
    fn run_ttbar_bkg(
        &self,
        cfg: &TtbarBkgConfig,
        tables: &BTreeMap<String, CombinedSample>,
        out: &mut dyn Write,
    ) -> Result<()> {
        info!(
            r_factor = cfg.r_factor,
            err_r_factor = cfg.err_r_factor,
            non_ttbar = %cfg.non_ttbar_bkg_sample,
            "ttbar data-driven prediction"
        );
        let raw = special_mode_sample(tables, &cfg.raw_data_sample)?;
        let non_ttbar = special_mode_sample(tables, &cfg.non_ttbar_bkg_sample)?;

        let mut bkg_table = non_ttbar.table.clone();
        // remove the x1000 from the MC composite
        bkg_table.scale(1.0 / 1000.0, 0.0)?;
        let mut prediction = raw.table.clone();
        // NOT zeroing entries where the data runs out
        prediction.subtract(&bkg_table, false)?;
        prediction.scale(cfg.r_factor, cfg.err_r_factor)?;
        prediction.square_errors_for_efficiency()?;
        prediction.calculate_efficiency()?;
        prediction.write(out, &cfg.prediction_name)?;

        if !self.opts.tables_only {
            let mut histos = raw.histos.clone();
            histos.subtract(&non_ttbar.histos)?;
            histos.scale(cfg.r_factor);
            let plots_path = self.opts.output_dir.join(format!(
                "{}_{}_plots.json",
                self.opts.analysis_code, cfg.prediction_name
            ));
            histos.to_archive(&cfg.prediction_name).write(&plots_path)?;
        }
        Ok(())
    }

    /// QCD closure: subtract the summed non-QCD MC from the observed data.
    fn run_qcd_closure(
        &self,
        cfg: &QcdClosureConfig,
        tables: &BTreeMap<String, CombinedSample>,
        out: &mut dyn Write,
    ) -> Result<()> {
        info!(non_qcd = %cfg.non_qcd_bkg_sample, "QCD closure observation");
        let data = special_mode_sample(tables, &cfg.data_sample)?;
        let non_qcd = special_mode_sample(tables, &cfg.non_qcd_bkg_sample)?;

        let mut bkg_table = non_qcd.table.clone();
        bkg_table.scale(1.0 / 1000.0, 0.0)?;
        let mut closure = data.table.clone();
        closure.subtract(&bkg_table, false)?;
        closure.square_errors_for_efficiency()?;
        closure.calculate_efficiency()?;
        closure.write(out, &cfg.closure_name)?;

        if !self.opts.tables_only {
            let mut histos = data.histos.clone();
            histos.subtract(&non_qcd.histos)?;
            let plots_path = self.opts.output_dir.join(format!(
                "{}_{}_plots.json",
                self.opts.analysis_code, cfg.closure_name
            ));
            histos.to_archive(&cfg.closure_name).write(&plots_path)?;
        }
        Ok(())
    }
}

fn special_mode_sample<'a>(
    tables: &'a BTreeMap<String, CombinedSample>,
    name: &str,
) -> Result<&'a CombinedSample> {
    tables.get(name).ok_or_else(|| {
        Error::Config(format!(
            "special-mode sample '{}' was not combined in this run",
            name
        ))
    })
}

/// The dataset name of one input-list line: the file stem with any `_tree`
/// marker removed.
fn dataset_from_input_line(line: &str) -> String {
    let stem = line
        .rsplit('/')
        .next()
        .unwrap_or(line)
        .split('.')
        .next()
        .unwrap_or(line);
    stem.replace("_tree", "")
}

/// Candidate locations for a piece's plots file, in probe order: the flat
/// input directory first (the most frequent layout), then the per-dataset
/// `output/` subdirectory, each with the `_0`-suffixed variant preferred.
/// If the dataset name ends in `_reduced_skim` and no file matches, the
/// stripped name is probed as a fallback.
fn locate_piece_files(opts: &CombineOptions, dataset: &str) -> Option<PieceFiles> {
    let mut stems = vec![dataset.to_string()];
    if let Some(stripped) = dataset.strip_suffix("_reduced_skim") {
        stems.push(stripped.to_string());
    }
    for stem in &stems {
        let base = format!("{}___{}", opts.analysis_code, stem);
        let dirs = [opts.input_dir.clone(), opts.input_dir.join(&base).join("output")];
        let names = [format!("{}_0.json", base), format!("{}.json", base)];
        for dir in &dirs {
            for name in &names {
                let plots = dir.join(name);
                if plots.is_file() {
                    let tables = plots.with_extension("dat");
                    if !tables.is_file() {
                        warn!(path = %tables.display(), "companion table file not found");
                        return None;
                    }
                    return Some(PieceFiles { plots, tables });
                }
            }
        }
    }
    None
}

//! hepstack CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hs_combine::context::{CombinationContext, CombineOptions, QcdClosureConfig, TtbarBkgConfig};
use hs_combine::qcd::{QcdYieldOptions, run_qcd_yield};

#[derive(Parser)]
#[command(name = "hepstack")]
#[command(about = "hepstack - combine per-dataset analysis outputs into composite samples")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Combine per-piece tables and histograms into composite samples
    Combine {
        /// List of all datasets to be used (full path required)
        #[arg(short, long)]
        input_list: PathBuf,

        /// Name of the analysis code used to generate the input files
        /// (the beginning of the file names before `___`)
        #[arg(short = 'c', long)]
        code: String,

        /// Directory containing the per-piece plots/tables files
        #[arg(short = 'd', long)]
        input_dir: PathBuf,

        /// Integrated luminosity in pb^-1 that results are rescaled to
        #[arg(short = 'l', long)]
        int_lumi: f64,

        /// Cross-section file in pb; use -1 as the value for no rescaling
        #[arg(short = 'x', long)]
        xsection: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Samples-to-combine file
        #[arg(short = 's', long)]
        sample_list: PathBuf,

        /// Only combine tables, do not do plots
        #[arg(short = 't', long)]
        tables_only: bool,

        /// Combine only this composite sample (batch worker mode)
        #[arg(long)]
        sample: Option<String>,

        /// Treat the same LHE scale/PDF variation index as correlated
        /// across the pieces of a composite sample
        #[arg(long)]
        correlate_lhe_systematics: bool,

        /// Do the ttbar background prediction from data after combining
        #[arg(short = 'b', long)]
        ttbar_bkg: bool,

        /// Do the QCD closure observation after combining
        #[arg(short = 'q', long)]
        qcd_closure: bool,

        /// Worker-pool cap for the per-sample fan-out
        #[arg(long, default_value = "4")]
        threads: usize,
    },

    /// Data-driven QCD yield: 1FR minus DY contamination minus 2FR
    QcdYield {
        /// Directory containing the single-fake-rate estimate results
        #[arg(short = 's', long)]
        single_fake_rate_dir: PathBuf,

        /// Directory containing the double-fake-rate estimate results
        #[arg(short = 'd', long)]
        double_fake_rate_dir: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output_dir: PathBuf,

        /// File name for the subtracted plots output
        #[arg(short = 'f', long, default_value = "qcdSubtracted_plots.json")]
        file_name: String,

        /// Sample holding the data-driven QCD estimate
        #[arg(long, default_value = "QCDFakes_DATA")]
        qcd_sample: String,

        /// MC sample for the Drell-Yan contamination of the 1FR region
        #[arg(long, default_value = "ZJet_amcatnlo_ptBinned_IncStitch")]
        zjet_sample: String,

        /// Selection name from which on 2FR clip warnings are emitted
        #[arg(long, default_value = "PassIDRequirements")]
        warn_after_cut: String,
    },

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Combine {
            input_list,
            code,
            input_dir,
            int_lumi,
            xsection,
            output_dir,
            sample_list,
            tables_only,
            sample,
            correlate_lhe_systematics,
            ttbar_bkg,
            qcd_closure,
            threads,
        } => cmd_combine(
            input_list,
            code,
            input_dir,
            int_lumi,
            xsection,
            output_dir,
            sample_list,
            tables_only,
            sample,
            correlate_lhe_systematics,
            ttbar_bkg,
            qcd_closure,
            threads,
        ),
        Commands::QcdYield {
            single_fake_rate_dir,
            double_fake_rate_dir,
            output_dir,
            file_name,
            qcd_sample,
            zjet_sample,
            warn_after_cut,
        } => cmd_qcd_yield(
            single_fake_rate_dir,
            double_fake_rate_dir,
            output_dir,
            file_name,
            qcd_sample,
            zjet_sample,
            warn_after_cut,
        ),
        Commands::Version => {
            println!("hepstack {}", hs_core::VERSION);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_combine(
    input_list: PathBuf,
    code: String,
    input_dir: PathBuf,
    int_lumi: f64,
    xsection: PathBuf,
    output_dir: PathBuf,
    sample_list: PathBuf,
    tables_only: bool,
    sample: Option<String>,
    correlate_lhe_systematics: bool,
    ttbar_bkg: bool,
    qcd_closure: bool,
    threads: usize,
) -> Result<()> {
    if int_lumi <= 0.0 {
        anyhow::bail!("int_lumi must be > 0");
    }
    let mut opts = CombineOptions::new(
        input_list,
        code,
        input_dir,
        int_lumi,
        xsection,
        output_dir.clone(),
        sample_list,
    );
    opts.tables_only = tables_only;
    opts.correlate_lhe_systematics = correlate_lhe_systematics;
    opts.threads = threads;
    if ttbar_bkg {
        opts.ttbar_bkg = Some(TtbarBkgConfig::default());
    }
    if qcd_closure {
        opts.qcd_closure = Some(QcdClosureConfig::default());
    }

    let ctx = CombinationContext::initialize(opts)?;
    match sample {
        Some(name) => {
            // batch worker mode: one composite sample, one output pair
            std::fs::create_dir_all(&output_dir)?;
            let combined = ctx.combine_sample(&name)?;
            let (plots, tables) = ctx.write_sample_outputs(&combined)?;
            tracing::info!(plots = %plots.display(), tables = %tables.display(), "done");
        }
        None => ctx.run()?,
    }
    Ok(())
}

fn cmd_qcd_yield(
    single_fake_rate_dir: PathBuf,
    double_fake_rate_dir: PathBuf,
    output_dir: PathBuf,
    file_name: String,
    qcd_sample: String,
    zjet_sample: String,
    warn_after_cut: String,
) -> Result<()> {
    if !single_fake_rate_dir.is_dir() {
        anyhow::bail!("dir {} does not exist", single_fake_rate_dir.display());
    }
    if !double_fake_rate_dir.is_dir() {
        anyhow::bail!("dir {} does not exist", double_fake_rate_dir.display());
    }
    let mut opts = QcdYieldOptions::new(single_fake_rate_dir, double_fake_rate_dir, output_dir);
    opts.file_name = file_name;
    opts.config.qcd_sample = qcd_sample;
    opts.config.zjet_sample = zjet_sample;
    opts.config.warn_after_cut = warn_after_cut;
    run_qcd_yield(&opts)?;
    Ok(())
}

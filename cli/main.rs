#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use manifold_twins::{AnalysisSettings, Dataset, run_analysis};

#[derive(Args)]
pub struct RunArgs {
    /// Target table CSV with a name column and one column per metadata key
    #[arg(value_name = "TARGETS_CSV")]
    pub targets: PathBuf,

    /// Long-format spectra CSV: target,spectrum,phase,wave,flux,fluxerr
    #[arg(value_name = "SPECTRA_CSV")]
    pub spectra: PathBuf,

    /// TOML settings file; missing fields take their defaults
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Where to write the per-target results
    #[arg(long, default_value = "twins_results.tsv")]
    pub output: PathBuf,

    /// Override the standardization source (rbtl, salt or salt_raw)
    #[arg(long)]
    pub standardization: Option<String>,

    /// Override the cache directory
    #[arg(long)]
    pub cache_directory: Option<PathBuf>,

    /// Ignore stored fits and recompute them
    #[arg(long)]
    pub no_cache: bool,

    /// Reveal the magnitudes of the validation subset
    #[arg(long)]
    pub unblind: bool,

    /// Override the verbosity (0 = warnings only, 3 = trace)
    #[arg(short, long)]
    pub verbosity: Option<u8>,
}

#[derive(Parser)]
#[command(
    name = "manifold-twins",
    about = "Spectral twins manifold standardization of Type Ia supernovae",
    long_about = "Interpolates each supernova's spectrum to maximum light, dereddens it, \
                 embeds the residual spectra on the twins manifold and standardizes \
                 brightnesses with a Gaussian process over that manifold."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis
    Run(RunArgs),
    /// Print the default settings as TOML
    Config,
}

fn log_level(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = match &args.settings {
        Some(path) => AnalysisSettings::load(&path.to_string_lossy())?,
        None => AnalysisSettings::default(),
    };
    if let Some(standardization) = args.standardization {
        settings.standardization = standardization;
    }
    if let Some(directory) = args.cache_directory {
        settings.cache_directory = directory;
    }
    if let Some(verbosity) = args.verbosity {
        settings.verbosity = verbosity;
    }
    if args.no_cache {
        settings.use_cache = false;
    }
    if args.unblind {
        settings.blinded = false;
    }

    env_logger::Builder::new()
        .filter_level(log_level(settings.verbosity))
        .format_timestamp(None)
        .init();

    let dataset = Dataset::load_csv(&args.targets, &args.spectra)?;
    let report = run_analysis(&dataset, &settings)?;
    report.write_tsv(&args.output)?;

    println!(
        "{} targets analyzed ({} kept of {} ingested).",
        report.target_names.len(),
        report.attrition.usable,
        report.attrition.initial
    );
    if let Some(salt) = &report.salt {
        println!(
            "SALT2:    MB {:.3}  alpha {:.3}  beta {:.3}  sigma_int {:.3}  NMAD {:.3}",
            salt.absolute_magnitude, salt.alpha, salt.beta, salt.intrinsic_dispersion, salt.nmad
        );
    }
    println!(
        "Manifold GP ({}): NMAD {:.3} mag, std {:.3} mag, hyperparameters {:?}",
        report.manifold.kind,
        report.manifold.nmad,
        report.manifold.std,
        report.manifold.hyperparameters.to_vec()
    );
    println!(
        "Twin pairs: RMS {:.3} mag, NMAD {:.3} mag",
        report.twins.rms, report.twins.nmad
    );
    println!("Results written to {}", args.output.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Config) => AnalysisSettings::default()
            .to_toml()
            .map(|text| print!("{text}"))
            .map_err(Into::into),
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("Error: {e}");
            }
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

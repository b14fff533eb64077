//! combfit CLI

use anyhow::{bail, Context, Result};
use cf_combine::{combine_analyses, rebin_analysis, CombinationMode};
use cf_core::ErrorDisplay;
use cf_model::{consistency, CalibrationInfo};
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "combfit")]
#[command(about = "combfit - calibration measurement combination")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Combine every identity group of a calibration file
    Combine {
        /// Input calibration container (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Output file for the combined container (JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Fit each bin position independently instead of one joint fit per
        /// analysis group. Overrides the container's own flag.
        #[arg(long)]
        bin_by_bin: bool,

        /// Ignore keys ("<analysis full name>:<bin name>") for bins to drop
        /// before combining. Repeatable.
        #[arg(long = "ignore")]
        ignore: Vec<String>,

        /// Print per-bin errors as percentages of the central value
        #[arg(long)]
        percent: bool,
    },

    /// Rebin one analysis onto another analysis's binning
    Rebin {
        /// Input calibration container (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Name of the analysis providing the template binning
        #[arg(long)]
        template: String,

        /// Name of the analysis to rebin
        #[arg(long)]
        analysis: String,

        /// Output file for the rebinned container (JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate bin boundaries and correlation flags without combining
    Validate {
        /// Input calibration container (JSON)
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    match cli.command {
        Commands::Combine { input, output, bin_by_bin, ignore, percent } => {
            let mut info = CalibrationInfo::from_json_file(&input)
                .with_context(|| format!("reading {}", input.display()))?;

            let keys: HashSet<String> = ignore.into_iter().collect();
            let removed = info.apply_ignores(&keys);
            if removed > 0 {
                tracing::info!("dropped {removed} ignored bin(s)");
            }

            let mode = if bin_by_bin || info.bin_by_bin {
                CombinationMode::BySingleBin
            } else {
                CombinationMode::ByFullAnalysis
            };
            let combined = combine_analyses(&info, mode)?;
            eprintln!(
                "combined {} group(s): chi2 = {:.3}, ndof = {}, p = {:.4}",
                combined.analyses.len(),
                combined.quality.chi2,
                combined.quality.ndof,
                combined.quality.p_value
            );

            let display = if percent { ErrorDisplay::Percent } else { ErrorDisplay::Absolute };
            for ana in &combined.analyses {
                for bin in &ana.bins {
                    eprintln!(
                        "  {} {}: {:.4} +- {:.4} (stat) +- {:.4} (syst)",
                        ana.full_name(),
                        bin.name(),
                        bin.central_value,
                        display.render(bin.stat_error, bin.central_value),
                        display.render(bin.total_systematic_error(), bin.central_value),
                    );
                }
            }

            let result = CalibrationInfo { analyses: combined.analyses, ..info };
            write_output(&result, output.as_deref())
        }

        Commands::Rebin { input, template, analysis, output } => {
            let info = CalibrationInfo::from_json_file(&input)
                .with_context(|| format!("reading {}", input.display()))?;

            let template_bins: Vec<_> = info
                .analyses
                .iter()
                .find(|a| a.name == template)
                .map(|a| a.bins.iter().map(|b| b.spec.clone()).collect())
                .with_context(|| format!("no analysis named `{template}`"))?;
            let source = info
                .analyses
                .iter()
                .find(|a| a.name == analysis)
                .with_context(|| format!("no analysis named `{analysis}`"))?;

            let rebinned = rebin_analysis(&template_bins, source)?;
            let result = CalibrationInfo { analyses: vec![rebinned], ..info.clone() };
            write_output(&result, output.as_deref())
        }

        Commands::Validate { input } => {
            let info = CalibrationInfo::from_json_file(&input)
                .with_context(|| format!("reading {}", input.display()))?;

            let mut failures = 0usize;
            for ana in &info.analyses {
                match consistency::check_analysis(ana) {
                    Ok(_) => {}
                    Err(e) => {
                        failures += 1;
                        eprintln!("{}: {e}", ana.full_name());
                    }
                }
            }
            let refs: Vec<_> = info.analyses.iter().collect();
            if let Err(e) = consistency::check_systematic_flags(&refs) {
                failures += 1;
                eprintln!("{e}");
            }
            if failures > 0 {
                bail!("{failures} validation failure(s)");
            }
            eprintln!("{} analyses validated", info.analyses.len());
            Ok(())
        }
    }
}

fn write_output(info: &CalibrationInfo, output: Option<&std::path::Path>) -> Result<()> {
    match output {
        Some(path) => {
            info.to_json_file(path)
                .with_context(|| format!("writing {}", path.display()))?;
        }
        None => {
            println!("{}", info.to_json()?);
        }
    }
    Ok(())
}

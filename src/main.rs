//! PDF Optimizer CLI
//!
//! Command-line interface for shrinking PDFs and merging flattened page ranges.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use pdf_slim::{
    file_ops::{flatten_and_merge_files, optimize_pdf_file},
    AverageAlgorithm, OptimizationReport, OptimizeOptions, Optimizer, Profile, SaveOptions,
};
use std::path::PathBuf;

/// Shrink PDFs and merge page ranges
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Leave unfiltered streams uncompressed when saving
    #[arg(long, global = true)]
    no_compress_streams: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Optimize a PDF with a built-in profile
    Optimize {
        /// Input PDF file path
        #[arg(short, long)]
        input: PathBuf,

        /// Output PDF file path
        #[arg(short, long)]
        output: PathBuf,

        /// Optimizer profile
        #[arg(short, long, default_value = "high-compression")]
        profile: String,

        /// Process resources one at a time
        #[arg(long)]
        sequential: bool,
    },
    /// Rescale palette images, leaving every other resource untouched
    Downscale {
        /// Input PDF file path
        #[arg(short, long)]
        input: PathBuf,

        /// Output PDF file path
        #[arg(short, long)]
        output: PathBuf,

        /// Scale factor applied to both image dimensions
        #[arg(short, long, default_value = "0.5")]
        factor: f64,

        /// How covered source pixels are combined
        #[arg(short, long, value_enum, default_value = "mean")]
        algorithm: Algorithm,
    },
    /// Flatten form fields of each input and merge the selected pages
    Merge {
        /// Inputs as PATH or PATH:START-END (1-based, inclusive)
        #[arg(required = true)]
        inputs: Vec<String>,

        /// Output PDF file path
        #[arg(short, long)]
        output: PathBuf,

        /// Optimize the merged document with this profile before saving
        #[arg(short, long)]
        profile: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Algorithm {
    Mean,
    Median,
}

impl From<Algorithm> for AverageAlgorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Mean => AverageAlgorithm::Mean,
            Algorithm::Median => AverageAlgorithm::Median,
        }
    }
}

/// Parse `PATH` or `PATH:START-END` into a path and a 0-based range
fn parse_input(arg: &str) -> anyhow::Result<(PathBuf, Option<(usize, usize)>)> {
    let Some((path, range)) = arg.rsplit_once(':') else {
        return Ok((PathBuf::from(arg), None));
    };
    let Some((start, end)) = range.split_once('-') else {
        return Ok((PathBuf::from(arg), None));
    };
    let start: usize = start
        .trim()
        .parse()
        .with_context(|| format!("invalid start page in {:?}", arg))?;
    let end: usize = end
        .trim()
        .parse()
        .with_context(|| format!("invalid end page in {:?}", arg))?;
    if start == 0 || end == 0 {
        bail!("page numbers start at 1 in {:?}", arg);
    }
    Ok((PathBuf::from(path), Some((start - 1, end - 1))))
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

fn print_report(report: &OptimizationReport) {
    println!(
        "\nDone! Processed {} resources: {} replaced, {} skipped, {} failed ({} bytes saved)",
        report.total_resources,
        report.replaced_count(),
        report.skipped_count(),
        report.failed_count(),
        report.bytes_saved()
    );
    for (id, err) in report.failures() {
        println!("  {} {} R left unchanged: {}", id.0, id.1, err);
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let save = SaveOptions {
        compress_streams: !args.no_compress_streams,
    };

    match args.command {
        Command::Optimize {
            input,
            output,
            profile,
            sequential,
        } => {
            let profile: Profile = profile.parse()?;
            let optimizer = Optimizer::from_profile(profile.name())?.with_options(OptimizeOptions {
                parallel: !sequential,
                cancel: None,
            });
            let report = optimize_pdf_file(&input, &output, &optimizer, &save)?;
            print_report(&report);
            println!("Output saved to: {:?}", output);
        }
        Command::Downscale {
            input,
            output,
            factor,
            algorithm,
        } => {
            let optimizer = Optimizer::indexed_downscale(factor, algorithm.into())?;
            let report = optimize_pdf_file(&input, &output, &optimizer, &save)?;
            print_report(&report);
            println!("Output saved to: {:?}", output);
        }
        Command::Merge {
            inputs,
            output,
            profile,
        } => {
            let inputs = inputs
                .iter()
                .map(|arg| parse_input(arg))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let optimizer = profile
                .map(|name| Optimizer::from_profile(&name))
                .transpose()?;
            let report = flatten_and_merge_files(&inputs, &output, optimizer.as_ref(), &save)?;
            let flattened: usize = report.flattened.iter().map(|r| r.flattened.len()).sum();
            println!(
                "\nDone! Merged {} pages, flattened {} form fields",
                report.merge.pages_appended, flattened
            );
            for ((path, _), flatten) in inputs.iter().zip(&report.flattened) {
                for field in &flatten.skipped {
                    println!("  {:?}: field {:?} has no appearance, kept interactive", path, field);
                }
            }
            if let Some(optimized) = &report.optimized {
                print_report(optimized);
            }
            println!("Output saved to: {:?}", output);
        }
    }

    Ok(())
}

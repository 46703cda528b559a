use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::Term;
use deepimagej_ci::{
    convert_directory, convert_file, generate_macros, parse_model_identifiers, verify_outputs,
    BioimageioRepository, ConvertDirection, ConvertReporter, FsPorts, GenerateReporter,
    GenerateRequest, IndicatifProgressReporter, LineProgressReporter, Platform, VerifyReporter,
    DEFAULT_COLLECTION_URL,
};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Plain line output even when attached to a terminal
    #[arg(long, global = true)]
    plain: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that every file listed in a manifest exists with its minimum size
    Verify {
        #[arg(long = "json-fpath", value_name = "MANIFEST")]
        json_fpath: PathBuf,
    },
    /// Download models and write a macro running each of them on its sample input
    Generate {
        /// Comma separated model ids, nicknames or names
        #[arg(long = "model-nicknames", value_name = "MODELS")]
        model_nicknames: String,
        #[arg(long = "models-dir", value_name = "DIR")]
        models_dir: PathBuf,
        #[arg(long = "macro-path", value_name = "FILE")]
        macro_path: PathBuf,
        #[arg(long = "expected-files", value_name = "MANIFEST")]
        expected_files: PathBuf,
        #[arg(
            long = "collection-url",
            env = "BIOIMAGEIO_COLLECTION_URL",
            default_value = DEFAULT_COLLECTION_URL
        )]
        collection_url: String,
    },
    /// Convert .npy arrays to .tif images or back; directories are converted file by file
    Convert {
        #[arg(value_name = "SOURCE")]
        source: PathBuf,
        #[arg(value_name = "TARGET")]
        target: PathBuf,
        /// Axes of the array, e.g. "byxc"; needed only for .npy sources
        #[arg(long, default_value = "")]
        axes: String,
        /// Direction when converting directories
        #[arg(long, value_enum)]
        to: Option<TargetFormat>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum TargetFormat {
    Tif,
    Npy,
}

enum Reporter {
    Indicatif(IndicatifProgressReporter),
    Line(LineProgressReporter<std::io::Stdout>),
}

impl Reporter {
    fn select(plain: bool) -> Self {
        if plain || !Term::stdout().is_term() {
            Reporter::Line(LineProgressReporter::new())
        } else {
            Reporter::Indicatif(IndicatifProgressReporter::new())
        }
    }

    fn verify(&self) -> &dyn VerifyReporter {
        match self {
            Reporter::Indicatif(reporter) => reporter,
            Reporter::Line(reporter) => reporter,
        }
    }

    fn generate(&self) -> &dyn GenerateReporter {
        match self {
            Reporter::Indicatif(reporter) => reporter,
            Reporter::Line(reporter) => reporter,
        }
    }

    fn convert(&self) -> &dyn ConvertReporter {
        match self {
            Reporter::Indicatif(reporter) => reporter,
            Reporter::Line(reporter) => reporter,
        }
    }
}

fn run_convert(
    reporter: &Reporter,
    source: &Path,
    target: &Path,
    axes: &str,
    to: Option<TargetFormat>,
) -> Result<ExitCode, Box<dyn Error>> {
    let ports = FsPorts::new();

    if source.is_dir() {
        let direction = match to {
            Some(TargetFormat::Tif) => ConvertDirection::NpyToTiff,
            Some(TargetFormat::Npy) => ConvertDirection::TiffToNpy,
            None => return Err("--to is required when converting a directory".into()),
        };
        let stats = convert_directory(&ports, reporter.convert(), direction, source, target, axes)?;
        return Ok(if stats.failed == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    if !source.is_file() {
        return Err(format!("source not found: {}", source.display()).into());
    }
    let direction = ConvertDirection::from_paths(source, target).ok_or_else(|| {
        format!(
            "cannot convert {} to {}: expected .npy <-> .tif",
            source.display(),
            target.display()
        )
    })?;
    convert_file(&ports, direction, source, target, axes)?;
    reporter.convert().on_converted(source, target);
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let cli = Cli::parse();
    let reporter = Reporter::select(cli.plain);

    match cli.command {
        Command::Verify { json_fpath } => {
            let report = verify_outputs(&FsPorts::new(), reporter.verify(), &json_fpath)?;
            Ok(if report.stats.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Generate {
            model_nicknames,
            models_dir,
            macro_path,
            expected_files,
            collection_url,
        } => {
            let identifiers = parse_model_identifiers(&model_nicknames);
            if identifiers.is_empty() {
                return Err("no model identifiers given".into());
            }

            let repository = BioimageioRepository::connect(&collection_url)?;
            let request = GenerateRequest {
                identifiers,
                models_dir,
                macro_path,
                manifest_path: expected_files,
                platform: Platform::current(),
            };
            generate_macros(&repository, &FsPorts::new(), reporter.generate(), &request)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Convert {
            source,
            target,
            axes,
            to,
        } => run_convert(&reporter, &source, &target, &axes, to),
    }
}

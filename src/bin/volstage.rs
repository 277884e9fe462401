use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use volstage::app::{App, PipelineResult};
use volstage::archive::NbiaHttpClient;
use volstage::codec::{DicomNiftiCodec, ImageRasterReader};
use volstage::config::{ConfigLoader, ConfigOverrides};
use volstage::domain::UnitOutcome;
use volstage::error::StageError;
use volstage::manifest::DatasetManifest;
use volstage::output::{JsonOutput, OutputMode, TracingSink};
use volstage::relocate::RelocationMode;
use volstage::verify::IntegrityReport;

#[derive(Parser)]
#[command(name = "volstage")]
#[command(about = "Resumable staging of volumetric medical images into an nnU-Net raw dataset")]
#[command(version, author)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Config file (default: ./volstage.json)
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    source: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    destination: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    staging: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    batch_size: Option<usize>,

    #[arg(long, global = true)]
    collection: Option<String>,

    #[arg(long, global = true)]
    modality: Option<String>,

    /// Print machine-readable JSON instead of the human summary
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download pending series from the archive in batches and convert them")]
    Acquire,
    #[command(about = "Convert already-downloaded DICOM series found under the source")]
    Convert,
    #[command(about = "Move case folders into the dataset (deletes sources; keep a backup)")]
    Relocate,
    #[command(about = "Copy case folders into the dataset without deleting sources")]
    Organize,
    #[command(about = "Rebuild volumes from per-case 2D slice folders")]
    Reconstruct,
    #[command(about = "Check every produced volume is readable and 3D")]
    Verify,
    #[command(about = "Rewrite dataset.json from the cases on disk")]
    Manifest,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<StageError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &StageError) -> u8 {
    match error {
        StageError::MissingConfig
        | StageError::ConfigRead(_)
        | StageError::ConfigParse(_)
        | StageError::InvalidConfig(_) => 2,
        StageError::ArchiveHttp(_)
        | StageError::ArchiveStatus { .. }
        | StageError::ArchiveListing(_) => 3,
        StageError::NoSpace { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.global.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let overrides = ConfigOverrides {
        source_path: cli.global.source,
        destination_path: cli.global.destination,
        staging_path: cli.global.staging,
        batch_size: cli.global.batch_size,
        collection: cli.global.collection,
        modality: cli.global.modality,
    };
    let config = ConfigLoader::resolve(cli.global.config.as_deref(), overrides)?;
    let archive = NbiaHttpClient::new()?;
    let app = App::new(config, archive, DicomNiftiCodec::new(), ImageRasterReader);

    match cli.command {
        Commands::Acquire => finish_run(app.acquire(&TracingSink)?, output_mode),
        Commands::Convert => finish_run(app.convert_local(&TracingSink)?, output_mode),
        Commands::Relocate => finish_run(
            app.relocate(RelocationMode::Move, &TracingSink)?,
            output_mode,
        ),
        Commands::Organize => finish_run(
            app.relocate(RelocationMode::Copy, &TracingSink)?,
            output_mode,
        ),
        Commands::Reconstruct => finish_run(app.reconstruct(&TracingSink)?, output_mode),
        Commands::Verify => {
            let report = app.verify(&TracingSink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_integrity(&report).into_diagnostic()?,
                OutputMode::Human => print_integrity_summary(&report),
            }
            if report.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                Err(StageError::IntegrityIssues(report.issue_count()).into())
            }
        }
        Commands::Manifest => {
            let manifest = app.write_manifest(&TracingSink)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_manifest(&manifest).into_diagnostic()?,
                OutputMode::Human => print_manifest_summary(&manifest),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn finish_run(result: PipelineResult, output_mode: OutputMode) -> miette::Result<ExitCode> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_result(&result).into_diagnostic()?,
        OutputMode::Human => print_run_summary(&result),
    }
    if result.is_aborted() {
        let no_space = result
            .summary
            .fatal
            .as_deref()
            .map(|reason| reason.contains("no space left"))
            .unwrap_or(false);
        return Ok(ExitCode::from(if no_space { 4 } else { 1 }));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_run_summary(result: &PipelineResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!(
        "{cyan}volstage {:?} -> {}{reset}",
        result.operation, result.destination
    );
    if let Some(acquisition) = &result.acquisition {
        println!(
            "{cyan}  listed {}, already complete {}, pending {}, chunks {}, committed {}{reset}",
            acquisition.listed,
            acquisition.already_complete,
            acquisition.pending,
            acquisition.chunks,
            acquisition.committed
        );
    }
    println!("{green}  processed: {}{reset}", result.summary.processed);
    println!("{yellow}  skipped: {}{reset}", result.summary.skipped);

    for unit in &result.summary.units {
        match &unit.outcome {
            UnitOutcome::Success => println!("{green}  + {}{reset}", unit.unit),
            UnitOutcome::Skipped(reason) => println!("{yellow}  - {} ({reason}){reset}", unit.unit),
            UnitOutcome::Fatal(reason) => println!("{red}  ! {} ({reason}){reset}", unit.unit),
        }
        for warning in &unit.warnings {
            println!("{yellow}      warning: {warning}{reset}");
        }
    }
    for case in &result.stranded {
        println!("{red}  stranded: {case} (source gone, destination pair incomplete){reset}");
    }
    match &result.manifest {
        Some(manifest) => println!(
            "{green}  dataset.json: {} training cases{reset}",
            manifest.num_training
        ),
        None => println!("{yellow}  dataset.json: not rewritten{reset}"),
    }
    if let Some(reason) = &result.summary.fatal {
        println!("{red}  aborted: {reason}{reset}");
    }
    println!("  issues: {}", result.issue_log);
}

fn print_integrity_summary(report: &IntegrityReport) {
    let green = "\x1b[32m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("checked {} files", report.checked);
    for file in report.issues() {
        if let Some(issue) = &file.issue {
            println!("{red}  ! {}: {issue}{reset}", file.path);
        }
    }
    if report.is_clean() {
        println!("{green}  all volumes readable and 3D{reset}");
    }
}

fn print_manifest_summary(manifest: &DatasetManifest) {
    println!(
        "\x1b[32mdataset.json written: {} ({} training cases, {}){reset}",
        manifest.name,
        manifest.num_training,
        manifest.file_ending,
        reset = "\x1b[0m"
    );
}

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use brainio_packaging::app::{App, ProgressSink, hash_file, show_stimulus_set};
use brainio_packaging::assembly::DataAssembly;
use brainio_packaging::config::{ConfigLoader, ResolvedConfig};
use brainio_packaging::domain::{AssemblyClass, AssemblyName, BucketName, StimulusSetName};
use brainio_packaging::error::PackagingError;
use brainio_packaging::lookup::LookupDb;
use brainio_packaging::output::{JsonOutput, LogSink, OutputMode, TextOutput};
use brainio_packaging::staging::Staging;
use brainio_packaging::table::ProtoStimulusSet;
use brainio_packaging::upload::{DirectoryObjectStore, ObjectStore, S3ObjectStore};

#[derive(Parser)]
#[command(name = "brainio-pkg")]
#[command(about = "Package BrainIO stimulus sets and data assemblies")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Archive, upload and register a stimulus set from a CSV table")]
    Stimuli(StimuliArgs),
    #[command(about = "Serialize, upload and register a data assembly from JSON")]
    Assembly(AssemblyArgs),
    #[command(about = "List the images and attributes of a stimulus set")]
    Show(ShowArgs),
    #[command(about = "Print the SHA-1 of a file")]
    Hash(HashArgs),
}

#[derive(Args)]
struct UploadArgs {
    #[arg(long)]
    bucket: Option<String>,

    /// Write objects under this directory instead of uploading to S3.
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[derive(Args)]
struct StimuliArgs {
    csv: PathBuf,

    #[arg(long)]
    name: String,

    #[command(flatten)]
    upload: UploadArgs,
}

#[derive(Args)]
struct AssemblyArgs {
    json: PathBuf,

    #[arg(long)]
    name: String,

    #[arg(long)]
    stimulus_set: String,

    #[arg(long, value_enum, default_value_t = AssemblyClass::NeuronRecordingAssembly)]
    class: AssemblyClass,

    #[command(flatten)]
    upload: UploadArgs,
}

#[derive(Args)]
struct ShowArgs {
    stimulus_set: String,
}

#[derive(Args)]
struct HashArgs {
    file: String,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<PackagingError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PackagingError) -> u8 {
    match error {
        PackagingError::NotFound { .. }
        | PackagingError::StimulusSetExists(_)
        | PackagingError::AssemblyExists(_)
        | PackagingError::StoreExists(_)
        | PackagingError::Conflict { .. } => 2,
        PackagingError::Upload { .. } | PackagingError::StorageClient(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };

    if let Commands::Hash(args) = &cli.command {
        let result = hash_file(&args.file)?;
        return match output_mode {
            OutputMode::Json => JsonOutput::print_hash(&result),
            OutputMode::Text => TextOutput::print_hash(&result),
        }
        .into_diagnostic();
    }

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let db = LookupDb::open(config.lookup_db.as_std_path())?;
    let staging = Staging::new_with_root(config.staging_dir.clone());

    match cli.command {
        Commands::Stimuli(args) => {
            let name: StimulusSetName = args.name.parse()?;
            let bucket = resolve_bucket(&args.upload, &config)?;
            let proto = ProtoStimulusSet::from_csv(&args.csv)?;
            with_store(&args.upload, &config, |store| {
                let app = App::new(staging, store);
                let result =
                    app.package_stimulus_set(&db, &proto, &name, &bucket, sink(output_mode))?;
                match output_mode {
                    OutputMode::Json => JsonOutput::print_stimulus_set(&result),
                    OutputMode::Text => TextOutput::print_stimulus_set(&result),
                }
                .into_diagnostic()
            })
        }
        Commands::Assembly(args) => {
            let name: AssemblyName = args.name.parse()?;
            let stimulus_set: StimulusSetName = args.stimulus_set.parse()?;
            let bucket = resolve_bucket(&args.upload, &config)?;
            let assembly = DataAssembly::from_json_file(&args.json)?;
            with_store(&args.upload, &config, |store| {
                let app = App::new(staging, store);
                let result = app.package_data_assembly(
                    &db,
                    &assembly,
                    &name,
                    &stimulus_set,
                    args.class,
                    &bucket,
                    sink(output_mode),
                )?;
                match output_mode {
                    OutputMode::Json => JsonOutput::print_assembly(&result),
                    OutputMode::Text => TextOutput::print_assembly(&result),
                }
                .into_diagnostic()
            })
        }
        Commands::Show(args) => {
            let name: StimulusSetName = args.stimulus_set.parse()?;
            let result = show_stimulus_set(&db, &name)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_show(&result),
                OutputMode::Text => TextOutput::print_show(&result),
            }
            .into_diagnostic()
        }
        Commands::Hash(_) => Ok(()),
    }
}

fn resolve_bucket(args: &UploadArgs, config: &ResolvedConfig) -> Result<BucketName, PackagingError> {
    match &args.bucket {
        Some(bucket) => bucket.parse(),
        None => Ok(config.bucket.clone()),
    }
}

/// Runs `work` with the store selected by `--store-dir`, falling back to S3.
fn with_store(
    args: &UploadArgs,
    config: &ResolvedConfig,
    work: impl FnOnce(Box<dyn ObjectStore>) -> miette::Result<()>,
) -> miette::Result<()> {
    let store: Box<dyn ObjectStore> = match &args.store_dir {
        Some(dir) => Box::new(DirectoryObjectStore::new(dir.clone())),
        None => Box::new(S3ObjectStore::new(&config.s3)?),
    };
    work(store)
}

fn sink(mode: OutputMode) -> &'static dyn ProgressSink {
    match mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &LogSink,
    }
}

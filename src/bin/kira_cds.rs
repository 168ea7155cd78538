use std::fs::{self, File};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use kira_cds::app::{Pipeline, PipelineOptions, TracingSink};
use kira_cds::config::{Config, ConfigLoader};
use kira_cds::domain::OutputIdSource;
use kira_cds::error::CdsError;
use kira_cds::input::load_proteins;
use kira_cds::ncbi::{EntrezHttpClient, SequenceService};
use kira_cds::output::{JsonOutput, TextOutput, write_outputs};
use kira_cds::retrieval::{CancelToken, RetrievalClient, SystemClock};
use kira_cds::store::{CachedService, Store};

const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "kira-cds")]
#[command(about = "Find the NCBI coding sequence for each protein in a FASTA file")]
#[command(version, author)]
struct Cli {
    /// Input protein FASTA (`-` for stdin, `.gz` accepted)
    input: Utf8PathBuf,

    /// Directory receiving the output FASTA files
    outdir: Utf8PathBuf,

    /// Contact address sent to NCBI with every request
    #[arg(long)]
    email: Option<String>,

    /// Treat `/start-stop` identifier suffixes as Stockholm regions
    #[arg(short = 's', long)]
    stockholm: bool,

    /// Give each CDS the identifier of its protein
    #[arg(long)]
    unify_seqid: bool,

    #[arg(long, value_enum, conflicts_with = "unify_seqid")]
    output_id: Option<OutputIdSource>,

    /// Accept a mismatching first residue (non-ATG start codons)
    #[arg(long)]
    alternative_start_codon: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    retries: Option<usize>,

    /// Minimum interval between NCBI requests in milliseconds
    #[arg(long)]
    rate_limit_ms: Option<u64>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// NCBI API key (defaults to $NCBI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long)]
    config: Option<Utf8PathBuf>,

    #[arg(short = 'd', long)]
    cache_dir: Option<Utf8PathBuf>,

    #[arg(short = 'c', long)]
    cache_stem: Option<String>,

    /// Reuse the cache left by a previous run instead of resetting it
    #[arg(long)]
    keep_cache: bool,

    /// Do not read or write the persistent cache
    #[arg(long, conflicts_with = "keep_cache")]
    no_cache: bool,

    #[arg(long)]
    filestem: Option<String>,

    #[arg(long)]
    skipped_fname: Option<String>,

    /// Also write log output to this file
    #[arg(short = 'l', long)]
    logfile: Option<Utf8PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> Config {
        let output_id = if self.unify_seqid {
            Some(OutputIdSource::Protein)
        } else {
            self.output_id
        };
        Config {
            stockholm: self.stockholm.then_some(true),
            output_id,
            alternative_start_codon: self.alternative_start_codon.then_some(true),
            batch_size: self.batch_size,
            retries: self.retries,
            rate_limit_ms: self.rate_limit_ms,
            concurrency: self.concurrency,
            email: self.email.clone(),
            api_key: self.api_key.clone(),
            cache_dir: self.cache_dir.clone(),
            cache_stem: self.cache_stem.clone(),
            keep_cache: self.keep_cache.then_some(true),
            filestem: self.filestem.clone(),
            skipped_fname: self.skipped_fname.clone(),
            ..Config::default()
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::from(EXIT_CANCELLED),
        Ok(false) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<CdsError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &CdsError) -> u8 {
    match error {
        CdsError::InvalidConfig(_)
        | CdsError::ConfigRead(_)
        | CdsError::ConfigParse(_)
        | CdsError::InputRead { .. }
        | CdsError::InputParse { .. }
        | CdsError::InvalidUniprotId(_) => 2,
        CdsError::EntrezHttp(_)
        | CdsError::EntrezStatus { .. }
        | CdsError::EntrezDecode(_)
        | CdsError::GenbankParse(_)
        | CdsError::ServiceUnreachable { .. } => 3,
        CdsError::Cancelled => EXIT_CANCELLED,
        CdsError::Filesystem(_) => 1,
    }
}

fn init_logging(cli: &Cli) -> miette::Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let stderr_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let file_layer = match &cli.logfile {
        Some(path) => {
            let file = File::create(path.as_std_path()).into_diagnostic()?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

/// Cancels `token` on the first Ctrl-C. The watcher thread is detached and
/// dies with the process.
fn watch_interrupt(token: CancelToken) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(error = %err, "interrupt handling unavailable");
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            warn!("interrupt received; finishing in-flight requests");
            token.cancel();
        }
    });
}

/// Returns whether the run was interrupted.
fn run() -> miette::Result<bool> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let file_config = ConfigLoader::load(cli.config.as_deref())?;
    let env_api_key = std::env::var("NCBI_API_KEY").ok();
    let config = ConfigLoader::resolve(file_config, cli.overrides(), env_api_key)?;
    let email = config.require_email()?.to_string();

    let records = load_proteins(&cli.input)?;
    fs::create_dir_all(cli.outdir.as_std_path())
        .map_err(|err| CdsError::Filesystem(err.to_string()))?;

    let http = EntrezHttpClient::new(&email, config.api_key.clone())?;
    let service: Arc<dyn SequenceService> = match (&config.cache, cli.no_cache) {
        (Some(cache), false) => {
            let store = Store::open(&cache.dir, &cache.stem, cache.keep)?;
            info!(path = %store.root(), keep = cache.keep, "using sequence cache");
            Arc::new(CachedService::new(http, store))
        }
        _ => Arc::new(http),
    };

    let cancel = CancelToken::new();
    watch_interrupt(cancel.clone());
    let retrieval = RetrievalClient::with_clock(
        service,
        config.retrieval,
        Arc::new(SystemClock),
        cancel.clone(),
    );
    let pipeline = Pipeline::new(&retrieval, PipelineOptions::from(&config));
    let report = pipeline.run(&records, &TracingSink)?;

    let outputs = write_outputs(&cli.outdir, &config.outputs, &records, &report)?;
    if cli.json {
        JsonOutput::print_run(&report, &outputs).into_diagnostic()?;
    } else {
        TextOutput::print_summary(&report.summary, &outputs).into_diagnostic()?;
    }
    Ok(report.summary.cancelled)
}

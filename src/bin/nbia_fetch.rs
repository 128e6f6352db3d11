use std::path::PathBuf;
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use nbia_fetch::cancel::CancellationToken;
use nbia_fetch::client::{HttpArchiveClient, ImageRequest};
use nbia_fetch::config::{ConfigLoader, ResolvedConfig};
use nbia_fetch::domain::{ApiHost, InstanceUid, SeriesUid};
use nbia_fetch::download::{DownloadTask, Downloader, ExistingPolicy, PackageLayout};
use nbia_fetch::error::NbiaError;
use nbia_fetch::manifest;
use nbia_fetch::output::{CsvOutput, JsonOutput, LogProgress};
use nbia_fetch::pager::Pager;
use nbia_fetch::query::{Endpoint, PageCursor, QueryBuilder, SearchCriteria, Sort};

#[derive(Parser)]
#[command(name = "nbia-fetch")]
#[command(about = "Query the NBIA imaging archive and download DICOM series")]
#[command(version, author)]
struct Cli {
    /// JSON config file; `nbia-fetch.json` is used when present.
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    api: Option<ApiHost>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a metadata query and print every page of results")]
    Search(SearchArgs),
    #[command(about = "Download series packages from a manifest or by UID")]
    Download(DownloadArgs),
    #[command(about = "Download one DICOM instance of a series")]
    Image(ImageArgs),
    #[command(about = "Parse a .tcia manifest and print what it contains")]
    Manifest(ManifestArgs),
}

#[derive(Args)]
struct SearchArgs {
    /// e.g. getSeries, getPatientStudy, getSimpleSearch, getSeriesMetaData,
    /// getSeriesSize, getSOPInstanceUIDs, or a value list such as
    /// getCollectionValues, getModalityValues, getBodyPartValues,
    /// getManufacturerValues
    endpoint: Endpoint,

    /// Filter as key=value; repeat for several filters.
    #[arg(long = "filter", short = 'f', value_name = "KEY=VALUE")]
    filters: Vec<String>,

    /// Field to sort by, optionally suffixed with `:desc`.
    #[arg(long)]
    sort: Option<Sort>,

    #[arg(long)]
    page_size: Option<usize>,

    /// Record offset to start paging from, e.g. the resume cursor of an
    /// earlier partial result.
    #[arg(long, default_value_t = 0)]
    start: usize,

    #[arg(long)]
    csv: bool,
}

#[derive(Args)]
#[command(group(clap::ArgGroup::new("source").required(true).args(["manifest", "series"])))]
struct DownloadArgs {
    #[arg(long)]
    manifest: Option<PathBuf>,

    #[arg(long, num_args = 1..)]
    series: Vec<SeriesUid>,

    #[arg(long)]
    dest: Option<Utf8PathBuf>,

    #[arg(long)]
    concurrency: Option<usize>,

    /// Request MD5 hashes and verify every file against them.
    #[arg(long)]
    md5: bool,

    #[arg(long)]
    skip_existing: bool,

    /// Keep `<uid>.zip` instead of extracting it.
    #[arg(long)]
    keep_zip: bool,

    /// Download only the first N series.
    #[arg(long)]
    limit: Option<usize>,

    /// Write a CSV of series metadata for the downloaded series.
    #[arg(long, value_name = "FILE")]
    metadata: Option<Utf8PathBuf>,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ImageArgs {
    #[arg(long)]
    series: SeriesUid,

    #[arg(long)]
    sop: InstanceUid,

    #[arg(long)]
    dest: Option<Utf8PathBuf>,

    #[arg(long)]
    skip_existing: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ManifestArgs {
    path: PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(nbia) = report.downcast_ref::<NbiaError>() {
                return ExitCode::from(map_exit_code(nbia));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &NbiaError) -> u8 {
    match error {
        NbiaError::InvalidQuery(_)
        | NbiaError::UnsupportedFilter { .. }
        | NbiaError::InvalidFilterValue { .. }
        | NbiaError::InvalidSeriesUid(_)
        | NbiaError::InvalidInstanceUid(_)
        | NbiaError::InvalidApiHost(_)
        | NbiaError::UnsupportedManifest(_)
        | NbiaError::GranularityMismatch { .. }
        | NbiaError::ConfigRead(_)
        | NbiaError::ConfigParse(_)
        | NbiaError::InvalidConfig(_) => 2,
        NbiaError::Http(_)
        | NbiaError::RequestRejected { .. }
        | NbiaError::Transient { .. }
        | NbiaError::UnexpectedResponse(_)
        | NbiaError::SchemaMismatch { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(api) = cli.api {
        config.client.host = api;
    }

    match cli.command {
        Commands::Search(args) => run_search(args, config),
        Commands::Download(args) => run_download(args, config),
        Commands::Image(args) => run_image(args, config),
        Commands::Manifest(args) => {
            let parsed = manifest::parse_file(&args.path)?;
            JsonOutput::print_manifest(&parsed).into_diagnostic()?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_search(args: SearchArgs, config: ResolvedConfig) -> miette::Result<ExitCode> {
    let mut criteria = SearchCriteria::new();
    for filter in &args.filters {
        let (key, value) = filter.split_once('=').ok_or_else(|| {
            NbiaError::InvalidQuery(format!("filter {filter} is not of the form key=value"))
        })?;
        criteria = criteria.with_raw(key.trim(), value.trim())?;
    }

    let page_size = args.page_size.unwrap_or(config.pager.page_size);
    let request = QueryBuilder::build(args.endpoint, &criteria, page_size, args.sort)?;
    let client = HttpArchiveClient::new(&config.client)?;
    let result = Pager::new(&client, config.pager).fetch_from(
        &request,
        PageCursor::Offset(args.start),
        &CancellationToken::new(),
    )?;
    if let Some(PageCursor::Offset(offset)) = result.resume_cursor() {
        tracing::warn!(offset, "results are partial; rerun with --start {offset} to continue");
    }

    if args.csv {
        CsvOutput::print_table(&result.results.to_table()).into_diagnostic()?;
    } else {
        JsonOutput::print_results(&result).into_diagnostic()?;
    }
    if result.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(3))
    }
}

fn run_download(args: DownloadArgs, config: ResolvedConfig) -> miette::Result<ExitCode> {
    let tasks = match &args.manifest {
        Some(path) => {
            let parsed = manifest::parse_file(path)?;
            for entry in &parsed.diagnostics {
                tracing::warn!(line = entry.line, content = %entry.content, "{}", entry.reason);
            }
            DownloadTask::from_manifest(&parsed)
        }
        None => args.series.into_iter().map(DownloadTask::new).collect(),
    };

    let mut options = config.download;
    if let Some(concurrency) = args.concurrency {
        options.concurrency = concurrency.max(1);
    }
    options.verify_md5 |= args.md5;
    if args.skip_existing {
        options.existing = ExistingPolicy::Skip;
    }
    if args.keep_zip {
        options.layout = PackageLayout::KeepArchive;
    }
    options.limit = args.limit;
    let destination = args.dest.unwrap_or(config.destination);

    let client = HttpArchiveClient::new(&config.client)?;
    let cancel = CancellationToken::new();
    let report = Downloader::new(&client, options).run(tasks, &destination, &cancel, &LogProgress)?;

    if let Some(path) = &args.metadata {
        let uids = report.downloaded_uids().into_iter().cloned().collect::<Vec<_>>();
        let metadata = Pager::new(&client, config.pager).fetch_series_metadata(&uids, &cancel)?;
        CsvOutput::write_table(path, &metadata.results.to_table()).into_diagnostic()?;
        tracing::info!(%path, series = metadata.results.len(), "metadata written");
    }

    if args.json {
        JsonOutput::print_report(&report).into_diagnostic()?;
    } else {
        println!("{report}");
    }
    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(3))
    }
}

fn run_image(args: ImageArgs, config: ResolvedConfig) -> miette::Result<ExitCode> {
    let mut options = config.download;
    if args.skip_existing {
        options.existing = ExistingPolicy::Skip;
    }
    let destination = args.dest.unwrap_or(config.destination);
    let request = ImageRequest {
        series: args.series,
        sop: args.sop,
        base_url: None,
    };

    let client = HttpArchiveClient::new(&config.client)?;
    let image =
        Downloader::new(&client, options).download_image(&request, &destination, &CancellationToken::new())?;

    if args.json {
        JsonOutput::print_image(&image).into_diagnostic()?;
    } else {
        println!("{}", image.path);
    }
    Ok(ExitCode::SUCCESS)
}

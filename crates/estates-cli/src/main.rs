use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use estates_adapters::StaticPageFetcher;
use estates_geo::{enrich_csv, PolygonIndex};
use estates_sync::{describe_stop, report_runs_markdown, SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "estates-cli")]
#[command(about = "Harvest sale listings into a CSV dataset and enrich them with municipalities")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch all pages, merge with the existing dataset and save it.
    Sync(SyncArgs),
    /// Append municipality columns to a CSV by point-in-polygon lookup.
    Enrich(EnrichArgs),
    /// Print a markdown overview of recent sync runs.
    Report(ReportArgs),
}

/// Overrides on top of the `ESTATES_*` environment configuration.
#[derive(Debug, Default, Args)]
struct SyncArgs {
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long)]
    per_page: Option<u32>,
    #[arg(long)]
    page_delay_ms: Option<u64>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long, conflicts_with = "reports_dir")]
    no_reports: bool,
    /// Read `page_<n>.json` responses from a directory instead of the live API.
    #[arg(long)]
    replay: Option<PathBuf>,
}

impl SyncArgs {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(path) = &self.dataset {
            config.dataset_path = path.clone();
        }
        if let Some(n) = self.max_pages {
            config.max_pages = n;
        }
        if let Some(n) = self.per_page {
            config.per_page = n;
        }
        if let Some(ms) = self.page_delay_ms {
            config.page_delay = Duration::from_millis(ms);
        }
        if let Some(dir) = &self.reports_dir {
            config.reports_dir = Some(dir.clone());
        }
        if self.no_reports {
            config.reports_dir = None;
        }
        config
    }
}

#[derive(Debug, Args)]
struct EnrichArgs {
    #[arg(long, default_value = "reality_houses.csv")]
    input: PathBuf,
    #[arg(long, default_value = "obce_polygony.geojson")]
    polygons: PathBuf,
    #[arg(long, default_value = "input_with_ruian.csv")]
    output: PathBuf,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long, default_value_t = 5)]
    runs: usize,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let config = args.apply(SyncConfig::from_env());
            let pipeline = match &args.replay {
                Some(dir) => {
                    let fetcher = StaticPageFetcher::from_fixture_dir(dir)
                        .with_context(|| format!("loading replay pages from {}", dir.display()))?;
                    info!(dir = %dir.display(), pages = fetcher.page_count(), "replaying recorded pages");
                    SyncPipeline::with_fetcher(config, Box::new(fetcher))
                }
                None => SyncPipeline::new(config)?,
            };
            let summary = pipeline.run_once().await?;
            print_summary(&summary);
        }
        Commands::Enrich(args) => {
            let index = PolygonIndex::load(&args.polygons)
                .with_context(|| format!("loading polygons {}", args.polygons.display()))?;
            let summary = enrich_csv(&args.input, &index, &args.output)?;
            println!(
                "enrich complete: rows={} matched={} without_coordinates={} output={}",
                summary.rows,
                summary.matched,
                summary.without_coordinates,
                args.output.display()
            );
        }
        Commands::Report(args) => {
            let root = args
                .reports_dir
                .or_else(|| SyncConfig::from_env().reports_dir)
                .unwrap_or_else(|| PathBuf::from("reports"));
            println!("{}", report_runs_markdown(args.runs, &root)?);
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "sync complete: run_id={} pages={} accepted={} rejected={} duplicates_removed={} rows={} saved={}",
        summary.run_id,
        summary.pages_fetched,
        summary.accepted,
        summary.rejected_total(),
        summary.duplicates_removed,
        summary.final_rows,
        summary.dataset_saved
    );
    println!("stopped: {}", describe_stop(&summary.stop_reason));
    if let Some(path) = &summary.preserved_unusable {
        println!("previous unusable dataset kept at {path}");
    }
    if let Some(dir) = &summary.report_dir {
        println!("report: {dir}");
    }
}

//! Sync pipeline: paginated collection, merge-dedup against history, persistence and reports.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{
    BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array, UInt8Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Local, NaiveDate, Utc};
use estates_adapters::{parse_listing, PageFetcher, ParseContext, SrealityFetcher, SREALITY_ESTATES_URL};
use estates_core::NormalizedListing;
use estates_storage::{sha256_hex, DatasetStore, LoadedDataset};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "estates-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub dataset_path: PathBuf,
    pub api_url: String,
    pub max_pages: u32,
    pub per_page: u32,
    pub page_delay: Duration,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// `None` disables per-run reports.
    pub reports_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("reality_houses.csv"),
            api_url: SREALITY_ESTATES_URL.to_string(),
            max_pages: 100,
            per_page: 500,
            page_delay: Duration::from_millis(500),
            user_agent: "Mozilla/5.0".to_string(),
            http_timeout_secs: 10,
            reports_dir: Some(PathBuf::from("reports")),
        }
    }
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dataset_path: std::env::var("ESTATES_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.dataset_path),
            api_url: std::env::var("ESTATES_API_URL").unwrap_or(defaults.api_url),
            max_pages: env_parsed("ESTATES_MAX_PAGES", defaults.max_pages),
            per_page: env_parsed("ESTATES_PER_PAGE", defaults.per_page),
            page_delay: Duration::from_millis(env_parsed("ESTATES_PAGE_DELAY_MS", 500u64)),
            user_agent: std::env::var("ESTATES_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parsed("ESTATES_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            reports_dir: match std::env::var("ESTATES_REPORTS_DIR") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => defaults.reports_dir,
            },
        }
    }

    pub fn collect_options(&self) -> CollectOptions {
        CollectOptions {
            max_pages: self.max_pages,
            per_page: self.per_page,
            page_delay: self.page_delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOptions {
    pub max_pages: u32,
    pub per_page: u32,
    /// Pause between consecutive page requests.
    pub page_delay: Duration,
}

/// Why pagination ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    /// The source returned a page with no records.
    EmptyPage { page: u32 },
    /// Transport or decode failure; indistinguishable from the end of data for the merge.
    FetchFailed { page: u32, error: String },
    MaxPagesReached { pages: u32 },
}

impl StopReason {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FetchFailed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Collected {
    pub listings: Vec<NormalizedListing>,
    /// Successful page responses, including the terminating empty page.
    pub pages_fetched: u32,
    pub records_seen: usize,
    pub rejected: BTreeMap<String, usize>,
    pub stop_reason: StopReason,
}

impl Collected {
    pub fn accepted(&self) -> usize {
        self.listings.len()
    }

    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// Fetch pages 1..=max_pages in order, parse every record and keep the accepted ones.
///
/// A page with zero raw records or a failed fetch stops pagination; a page whose
/// records were all rejected does not.
pub async fn collect_all(
    fetcher: &dyn PageFetcher,
    ctx: &ParseContext,
    options: &CollectOptions,
) -> Collected {
    let mut listings = Vec::new();
    let mut rejected: BTreeMap<String, usize> = BTreeMap::new();
    let mut pages_fetched = 0u32;
    let mut records_seen = 0usize;
    let mut stop_reason = StopReason::MaxPagesReached {
        pages: options.max_pages,
    };

    for page in 1..=options.max_pages {
        if page > 1 && !options.page_delay.is_zero() {
            tokio::time::sleep(options.page_delay).await;
        }

        let raw = match fetcher.fetch_page(page, options.per_page).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    source = fetcher.source_id(),
                    page,
                    error = %err,
                    "page fetch failed; stopping pagination"
                );
                stop_reason = StopReason::FetchFailed {
                    page,
                    error: err.to_string(),
                };
                break;
            }
        };
        pages_fetched += 1;

        if raw.is_empty() {
            info!(source = fetcher.source_id(), page, "empty page; no more listings");
            stop_reason = StopReason::EmptyPage { page };
            break;
        }

        let mut accepted_on_page = 0usize;
        for record in &raw.records {
            match parse_listing(record, ctx) {
                Ok(listing) => {
                    listings.push(listing);
                    accepted_on_page += 1;
                }
                Err(rejection) => {
                    if rejection.is_malformed() {
                        warn!(page, reason = %rejection, "dropping malformed listing");
                    } else {
                        debug!(page, reason = %rejection, "listing filtered out");
                    }
                    *rejected.entry(rejection.kind().to_string()).or_default() += 1;
                }
            }
        }
        records_seen += raw.records.len();
        info!(
            page,
            records = raw.records.len(),
            accepted = accepted_on_page,
            "page processed"
        );
    }

    Collected {
        listings,
        pages_fetched,
        records_seen,
        rejected,
        stop_reason,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub rows: Vec<NormalizedListing>,
    pub existing: usize,
    pub incoming: usize,
    pub duplicates_removed: usize,
}

/// Append `incoming` to `existing` and keep only the first row per id, so history wins.
pub fn reconcile(existing: Vec<NormalizedListing>, incoming: Vec<NormalizedListing>) -> Reconciled {
    let existing_count = existing.len();
    let incoming_count = incoming.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(existing_count + incoming_count);
    let rows: Vec<NormalizedListing> = existing
        .into_iter()
        .chain(incoming)
        .filter(|listing| seen.insert(listing.id.clone()))
        .collect();
    let duplicates_removed = existing_count + incoming_count - rows.len();
    Reconciled {
        rows,
        existing: existing_count,
        incoming: incoming_count,
        duplicates_removed,
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing source unreachable on page {page}: {error}")]
    SourceUnreachable { page: u32, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub captured_on: NaiveDate,
    pub source_id: String,
    pub pages_fetched: u32,
    pub records_seen: usize,
    pub accepted: usize,
    pub rejected: BTreeMap<String, usize>,
    pub stop_reason: StopReason,
    pub existing_rows: usize,
    /// Prior dataset rows dropped because they did not decode.
    #[serde(default)]
    pub skipped_history_rows: usize,
    pub duplicates_removed: usize,
    pub final_rows: usize,
    pub dataset_path: String,
    pub dataset_saved: bool,
    pub preserved_unusable: Option<String>,
    pub report_dir: Option<String>,
}

impl SyncRunSummary {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: Box<dyn PageFetcher>,
    store: DatasetStore,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let fetcher = SrealityFetcher::from_config(
            config.api_url.clone(),
            &config.user_agent,
            Duration::from_secs(config.http_timeout_secs),
        )?;
        Ok(Self::with_fetcher(config, Box::new(fetcher)))
    }

    pub fn with_fetcher(config: SyncConfig, fetcher: Box<dyn PageFetcher>) -> Self {
        let store = DatasetStore::new(config.dataset_path.clone());
        Self {
            config,
            fetcher,
            store,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let ctx = ParseContext {
            captured_on: Local::now().date_naive(),
        };
        self.run_with(ctx).await
    }

    /// One full pass: collect, load history, reconcile, save, report.
    pub async fn run_with(&self, ctx: ParseContext) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, source = self.fetcher.source_id(), max_pages = self.config.max_pages, "sync started");

        let collected = collect_all(self.fetcher.as_ref(), &ctx, &self.config.collect_options()).await;
        if let StopReason::FetchFailed { page: 1, error } = &collected.stop_reason {
            return Err(SyncError::SourceUnreachable {
                page: 1,
                error: error.clone(),
            }
            .into());
        }
        info!(
            pages = collected.pages_fetched,
            accepted = collected.accepted(),
            rejected = collected.rejected_total(),
            stop = ?collected.stop_reason,
            "collection finished"
        );

        let loaded = self.store.load().await;
        let unusable = matches!(loaded, LoadedDataset::Unusable { .. });
        match &loaded {
            LoadedDataset::Missing => {
                info!(path = %self.store.path().display(), "no prior dataset; starting from empty")
            }
            LoadedDataset::Loaded { rows, skipped_rows } => {
                info!(path = %self.store.path().display(), rows = rows.len(), "loaded prior dataset");
                if *skipped_rows > 0 {
                    warn!(skipped_rows = *skipped_rows, "prior dataset rows could not be decoded and were dropped");
                }
            }
            LoadedDataset::Unusable { reason } => {
                warn!(%reason, "prior dataset unusable; starting from empty")
            }
        }
        let skipped_history_rows = loaded.skipped_rows();
        let existing = loaded.into_rows();

        let mut preserved_unusable = None;
        let (existing_rows, final_rows, duplicates_removed, dataset_saved, snapshot_rows) =
            if collected.listings.is_empty() {
                warn!("no listings collected; dataset left untouched");
                (existing.len(), existing.len(), 0, false, existing)
            } else {
                if unusable {
                    preserved_unusable = self
                        .store
                        .preserve_unusable(started_at)
                        .await?
                        .map(|p| p.display().to_string());
                    if let Some(path) = &preserved_unusable {
                        warn!(%path, "unusable dataset moved aside");
                    }
                }
                let reconciled = reconcile(existing, collected.listings.clone());
                info!(
                    existing = reconciled.existing,
                    incoming = reconciled.incoming,
                    duplicates_removed = reconciled.duplicates_removed,
                    rows = reconciled.rows.len(),
                    "merged with prior dataset"
                );
                self.store.save(&reconciled.rows).await.with_context(|| {
                    format!("saving dataset {}", self.store.path().display())
                })?;
                info!(
                    path = %self.store.path().display(),
                    rows = reconciled.rows.len(),
                    "dataset saved"
                );
                (
                    reconciled.existing,
                    reconciled.rows.len(),
                    reconciled.duplicates_removed,
                    true,
                    reconciled.rows,
                )
            };

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            captured_on: ctx.captured_on,
            source_id: self.fetcher.source_id().to_string(),
            pages_fetched: collected.pages_fetched,
            records_seen: collected.records_seen,
            accepted: collected.accepted(),
            rejected: collected.rejected.clone(),
            stop_reason: collected.stop_reason.clone(),
            existing_rows,
            skipped_history_rows,
            duplicates_removed,
            final_rows,
            dataset_path: self.store.path().display().to_string(),
            dataset_saved,
            preserved_unusable,
            report_dir: None,
        };

        if let Some(reports_root) = &self.config.reports_dir {
            let dir = reports_root.join(run_id.to_string());
            summary.report_dir = Some(dir.display().to_string());
            // The dataset is already persisted; a report failure must not fail the run.
            if let Err(err) = write_run_report(&dir, &summary, &snapshot_rows).await {
                warn!(dir = %dir.display(), error = %format!("{err:#}"), "run report not written");
                summary.report_dir = None;
            }
        }

        Ok(summary)
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    SyncPipeline::new(config)?.run_once().await
}

/// Write `run_summary.json`, a parquet snapshot of the dataset and a checksum manifest.
pub async fn write_run_report(
    dir: &Path,
    summary: &SyncRunSummary,
    rows: &[NormalizedListing],
) -> Result<PathBuf> {
    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let listings_path = snapshot_dir.join("listings.parquet");
    write_listings_parquet(&listings_path, rows)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![manifest_entry("listings", dir, &listings_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_listings_parquet(path: &Path, rows: &[NormalizedListing]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("hash_id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("price_czk", DataType::Int64, false),
        ArrowField::new("date_parsed", DataType::Utf8, false),
        ArrowField::new("is_auction", DataType::Boolean, false),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("category_main_cb", DataType::Int64, false),
        ArrowField::new("category_sub_cb", DataType::Int64, true),
        ArrowField::new("house_size_m2", DataType::UInt32, true),
        ArrowField::new("land_size_m2", DataType::UInt32, true),
        ArrowField::new("disposition", DataType::UInt8, true),
        ArrowField::new("comment", DataType::Utf8, true),
        ArrowField::new("new_building", DataType::Boolean, false),
        ArrowField::new("after_reconstruction", DataType::Boolean, false),
        ArrowField::new("furnished", DataType::Boolean, false),
        ArrowField::new("partly_furnished", DataType::Boolean, false),
        ArrowField::new("not_furnished", DataType::Boolean, false),
        ArrowField::new("in_construction", DataType::Boolean, false),
    ]));

    let flag = |f: fn(&NormalizedListing) -> bool| BooleanArray::from(rows.iter().map(f).collect::<Vec<_>>());

    let ids = StringArray::from(rows.iter().map(|r| Some(r.id.as_str())).collect::<Vec<_>>());
    let names = StringArray::from(rows.iter().map(|r| Some(r.title.as_str())).collect::<Vec<_>>());
    let prices = Int64Array::from(rows.iter().map(|r| r.price_czk).collect::<Vec<_>>());
    let dates = StringArray::from(
        rows.iter()
            .map(|r| r.captured_on.to_string())
            .collect::<Vec<String>>(),
    );
    let auctions = flag(|r| r.is_auction);
    let lats = Float64Array::from(rows.iter().map(|r| r.latitude).collect::<Vec<_>>());
    let lons = Float64Array::from(rows.iter().map(|r| r.longitude).collect::<Vec<_>>());
    let mains = Int64Array::from(rows.iter().map(|r| r.kind.category_main_cb()).collect::<Vec<_>>());
    let subs = Int64Array::from(rows.iter().map(|r| r.subclass()).collect::<Vec<_>>());
    let areas = UInt32Array::from(rows.iter().map(|r| r.area_m2).collect::<Vec<_>>());
    let lands = UInt32Array::from(rows.iter().map(|r| r.land_area_m2()).collect::<Vec<_>>());
    let layouts = UInt8Array::from(
        rows.iter()
            .map(|r| r.layout.map(|l| l.code()))
            .collect::<Vec<_>>(),
    );
    let comments = StringArray::from(rows.iter().map(|r| r.comment.as_deref()).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(names),
            Arc::new(prices),
            Arc::new(dates),
            Arc::new(auctions),
            Arc::new(lats),
            Arc::new(lons),
            Arc::new(mains),
            Arc::new(subs),
            Arc::new(areas),
            Arc::new(lands),
            Arc::new(layouts),
            Arc::new(comments),
            Arc::new(flag(|r| r.amenities.new_building)),
            Arc::new(flag(|r| r.amenities.after_reconstruction)),
            Arc::new(flag(|r| r.amenities.furnished)),
            Arc::new(flag(|r| r.amenities.partly_furnished)),
            Arc::new(flag(|r| r.amenities.not_furnished)),
            Arc::new(flag(|r| r.amenities.in_construction)),
        ],
    )
    .context("building listings record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, report_dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(report_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

/// Markdown overview of the most recent `runs` run reports under `reports_root`.
pub fn report_runs_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry?;
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let summary_path = entry.path().join("run_summary.json");
        if !summary_path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let summary: SyncRunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", summary_path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by_key(|s| std::cmp::Reverse(s.started_at));

    let mut lines = vec!["# Listing Sync Runs".to_string(), String::new()];
    for s in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", s.run_id));
        lines.push(format!("- started: {}", s.started_at.to_rfc3339()));
        lines.push(format!("- source: {}", s.source_id));
        lines.push(format!("- pages fetched: {}", s.pages_fetched));
        lines.push(format!(
            "- records: {} seen, {} accepted, {} rejected",
            s.records_seen,
            s.accepted,
            s.rejected_total()
        ));
        lines.push(format!("- duplicates removed: {}", s.duplicates_removed));
        lines.push(format!("- final rows: {}", s.final_rows));
        lines.push(format!("- stop: {}", describe_stop(&s.stop_reason)));
        if !s.dataset_saved {
            lines.push("- dataset not saved".to_string());
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

pub fn describe_stop(reason: &StopReason) -> String {
    match reason {
        StopReason::EmptyPage { page } => format!("empty page {page}"),
        StopReason::FetchFailed { page, error } => format!("fetch of page {page} failed: {error}"),
        StopReason::MaxPagesReached { pages } => format!("page limit {pages} reached"),
    }
}

//! Ingestion pipeline: run context, fetch scheduling, catalog assembly and validation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use shopfeed_adapters::{CandidateSource, ExportFileSource, SourceBatch};
use shopfeed_core::{
    default_features, describe, resolve_category, CategoryPolicy, CategoryRules, ImageResolution,
    ProductRecord, ResolutionStatus,
};
use shopfeed_storage::{
    image_filename, sha256_hex, write_file_atomic, HttpClientConfig, HttpFetcher, ImageResolver,
    ImageStore,
};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shopfeed-sync";

/// Everything one invocation needs; built once and handed to each component.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub export_path: PathBuf,
    pub public_dir: PathBuf,
    pub image_web_prefix: String,
    pub catalog_path: PathBuf,
    pub workers: usize,
    pub min_parallel_batch: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub category_policy: CategoryPolicy,
    pub category_rules_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            export_path: PathBuf::from("./export.xml"),
            public_dir: PathBuf::from("./client/public"),
            image_web_prefix: "/images/products".to_string(),
            catalog_path: PathBuf::from("./client/src/data/products.json"),
            workers: 10,
            min_parallel_batch: 4,
            http_timeout_secs: 5,
            user_agent: "shopfeed/0.1".to_string(),
            category_policy: CategoryPolicy::Classify,
            category_rules_path: None,
        }
    }
}

impl RunConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            export_path: std::env::var("SHOPFEED_EXPORT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_path),
            public_dir: std::env::var("SHOPFEED_PUBLIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.public_dir),
            image_web_prefix: std::env::var("SHOPFEED_IMAGE_PREFIX")
                .unwrap_or(defaults.image_web_prefix),
            catalog_path: std::env::var("SHOPFEED_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            workers: std::env::var("SHOPFEED_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.workers),
            min_parallel_batch: std::env::var("SHOPFEED_MIN_PARALLEL_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.min_parallel_batch),
            http_timeout_secs: std::env::var("SHOPFEED_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("SHOPFEED_USER_AGENT").unwrap_or(defaults.user_agent),
            category_policy: std::env::var("SHOPFEED_CATEGORY_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.category_policy),
            category_rules_path: std::env::var("SHOPFEED_CATEGORY_RULES")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn image_store(&self) -> ImageStore {
        ImageStore::new(self.public_dir.clone(), &self.image_web_prefix)
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.workers.max(1),
            ..Default::default()
        }
    }

    pub fn category_rules(&self) -> Result<CategoryRules> {
        match &self.category_rules_path {
            Some(path) => load_category_rules(path),
            None => Ok(CategoryRules::default()),
        }
    }
}

pub fn load_category_rules(path: &Path) -> Result<CategoryRules> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// One image to resolve, keyed by the product it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageJob {
    pub key: String,
    pub source_url: Option<String>,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub key: String,
    pub resolution: ImageResolution,
}

/// Bounded-width pool of image resolutions. Results come back unordered, one per job.
#[derive(Debug, Clone, Copy)]
pub struct FetchScheduler {
    width: usize,
    min_parallel_batch: usize,
}

impl FetchScheduler {
    pub fn new(width: usize, min_parallel_batch: usize) -> Self {
        Self {
            width: width.max(1),
            min_parallel_batch,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub async fn run(&self, resolver: &ImageResolver, jobs: Vec<ImageJob>) -> Vec<ResolvedImage> {
        if self.width == 1 || jobs.len() < self.min_parallel_batch {
            let mut results = Vec::with_capacity(jobs.len());
            for job in jobs {
                let resolution = resolver.resolve(job.source_url.as_deref(), &job.filename).await;
                results.push(ResolvedImage {
                    key: job.key,
                    resolution,
                });
            }
            return results;
        }

        let keys: Vec<String> = jobs.iter().map(|job| job.key.clone()).collect();
        let permits = Arc::new(Semaphore::new(self.width));
        let mut tasks = JoinSet::new();
        for job in jobs {
            let resolver = resolver.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let resolution = resolver.resolve(job.source_url.as_deref(), &job.filename).await;
                ResolvedImage {
                    key: job.key,
                    resolution,
                }
            });
        }

        let mut results = Vec::with_capacity(keys.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(resolved) => results.push(resolved),
                Err(err) => warn!(error = %err, "image task aborted"),
            }
        }

        if results.len() < keys.len() {
            let done: HashSet<String> = results.iter().map(|r| r.key.clone()).collect();
            for key in keys.into_iter().filter(|key| !done.contains(key)) {
                warn!(key, "no resolution recorded; using placeholder");
                results.push(ResolvedImage {
                    key,
                    resolution: resolver.placeholder(),
                });
            }
        }
        results
    }
}

/// Joins candidates with resolved images and derived fields into catalog records.
#[derive(Debug, Clone)]
pub struct CatalogAssembler {
    policy: CategoryPolicy,
    rules: CategoryRules,
}

impl CatalogAssembler {
    pub fn new(policy: CategoryPolicy, rules: CategoryRules) -> Self {
        Self { policy, rules }
    }

    pub fn plan_jobs(&self, batch: &SourceBatch) -> Vec<ImageJob> {
        batch
            .candidates
            .iter()
            .map(|candidate| {
                let source_url = batch.image_url_for(candidate).map(ToString::to_string);
                let filename = image_filename(
                    &candidate.id,
                    &candidate.title,
                    source_url.as_deref().unwrap_or_default(),
                );
                ImageJob {
                    key: candidate.id.clone(),
                    source_url,
                    filename,
                }
            })
            .collect()
    }

    /// Records follow source order; a candidate with no resolution gets the placeholder.
    pub fn assemble(
        &self,
        batch: &SourceBatch,
        resolved: &HashMap<String, ImageResolution>,
        placeholder_web_path: &str,
    ) -> Vec<ProductRecord> {
        batch
            .candidates
            .iter()
            .map(|candidate| ProductRecord {
                id: candidate.id.clone(),
                name: candidate.title.clone(),
                price: candidate.price_label(),
                category: resolve_category(
                    candidate.declared_category.as_deref(),
                    &candidate.title,
                    self.policy,
                    &self.rules,
                ),
                img: resolved
                    .get(&candidate.id)
                    .map(|r| r.local_path.clone())
                    .unwrap_or_else(|| placeholder_web_path.to_string()),
                description: describe(&candidate.title),
                features: default_features(),
            })
            .collect()
    }
}

/// Points every record whose image is missing or empty on disk at the placeholder.
pub async fn verify_images(records: &mut [ProductRecord], store: &ImageStore) -> usize {
    let placeholder = store.placeholder_web_path();
    let mut rewritten = 0;
    for record in records.iter_mut() {
        if record.img != placeholder && !store.web_path_exists(&record.img).await {
            warn!(id = %record.id, img = %record.img, "image missing before write; using placeholder");
            record.img = placeholder.clone();
            rewritten += 1;
        }
    }
    rewritten
}

/// Serializes the whole catalog and swaps it into place; returns its sha256.
pub async fn write_catalog(path: &Path, records: &[ProductRecord]) -> Result<String> {
    let bytes = serde_json::to_vec_pretty(records).context("serializing catalog")?;
    write_file_atomic(path, &bytes)
        .await
        .with_context(|| format!("writing catalog {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub parsed_products: usize,
    pub skipped_entries: usize,
    pub attachments: usize,
    pub images_fetched: usize,
    pub images_cached: usize,
    pub images_placeholder: usize,
    pub verified_rewrites: usize,
    pub catalog_path: String,
    pub catalog_sha256: String,
}

pub struct IngestPipeline {
    config: RunConfig,
    http: Arc<HttpFetcher>,
    resolver: ImageResolver,
    source: Box<dyn CandidateSource>,
    assembler: CatalogAssembler,
    scheduler: FetchScheduler,
}

impl IngestPipeline {
    pub fn new(config: RunConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_config())?);
        let resolver = ImageResolver::new(config.image_store(), http.clone());
        let assembler = CatalogAssembler::new(config.category_policy, config.category_rules()?);
        let scheduler = FetchScheduler::new(config.workers, config.min_parallel_batch);
        let source = Box::new(ExportFileSource::new(config.export_path.clone()));
        Ok(Self {
            config,
            http,
            resolver,
            source,
            assembler,
            scheduler,
        })
    }

    pub fn with_source(mut self, source: Box<dyn CandidateSource>) -> Self {
        self.source = source;
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let store = self.resolver.store();

        let batch = self
            .source
            .load(&self.http)
            .await
            .with_context(|| format!("loading candidates from {}", self.source.source_id()))?;

        store.ensure_placeholder().await?;

        let jobs = self.assembler.plan_jobs(&batch);
        info!(
            %run_id,
            products = jobs.len(),
            workers = self.scheduler.width(),
            "resolving product images"
        );
        let resolved: HashMap<String, ImageResolution> = self
            .scheduler
            .run(&self.resolver, jobs)
            .await
            .into_iter()
            .map(|r| (r.key, r.resolution))
            .collect();

        let count =
            |status: ResolutionStatus| resolved.values().filter(|r| r.status == status).count();
        let images_fetched = count(ResolutionStatus::Fetched);
        let images_cached = count(ResolutionStatus::Cached);
        let images_placeholder = count(ResolutionStatus::Fallback);

        let mut records = self
            .assembler
            .assemble(&batch, &resolved, &store.placeholder_web_path());

        store.ensure_placeholder().await?;
        let verified_rewrites = verify_images(&mut records, store).await;
        let catalog_sha256 = write_catalog(&self.config.catalog_path, &records).await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            source: self.source.source_id().to_string(),
            parsed_products: batch.candidates.len(),
            skipped_entries: batch.diagnostics.len(),
            attachments: batch.attachments.len(),
            images_fetched,
            images_cached,
            images_placeholder,
            verified_rewrites,
            catalog_path: self.config.catalog_path.display().to_string(),
            catalog_sha256,
        };
        info!(
            %run_id,
            parsed = summary.parsed_products,
            skipped = summary.skipped_entries,
            fetched = summary.images_fetched,
            cached = summary.images_cached,
            placeholder = summary.images_placeholder,
            rewrites = summary.verified_rewrites,
            catalog = %summary.catalog_path,
            "ingestion complete"
        );
        Ok(summary)
    }
}

pub async fn run_ingest_once(config: RunConfig) -> Result<RunSummary> {
    IngestPipeline::new(config)?.run_once().await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PruneSummary {
    pub before: usize,
    pub removed: usize,
    pub after: usize,
}

/// Drops catalog records whose image is absent from the store and rewrites the file.
///
/// Unlike ingestion, which keeps such records pointing at the placeholder, this removes them.
/// Records are kept verbatim, including fields this crate does not know about.
pub async fn prune_catalog(catalog_path: &Path, store: &ImageStore) -> Result<PruneSummary> {
    let text = fs::read_to_string(catalog_path)
        .await
        .with_context(|| format!("reading {}", catalog_path.display()))?;
    let records: Vec<serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", catalog_path.display()))?;
    let before = records.len();

    let mut kept = Vec::with_capacity(before);
    for record in records {
        let img = record
            .get("img")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if store.web_path_exists(img).await {
            kept.push(record);
        } else {
            warn!(
                id = %record.get("id").map(|v| v.to_string()).unwrap_or_default(),
                img,
                "removing record with missing image"
            );
        }
    }

    let bytes = serde_json::to_vec_pretty(&kept).context("serializing pruned catalog")?;
    write_file_atomic(catalog_path, &bytes)
        .await
        .with_context(|| format!("writing {}", catalog_path.display()))?;

    let summary = PruneSummary {
        before,
        removed: before - kept.len(),
        after: kept.len(),
    };
    info!(
        before = summary.before,
        removed = summary.removed,
        after = summary.after,
        "catalog pruned"
    );
    Ok(summary)
}

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shopfeed_adapters::{CandidateSource, ShopCrawlSource, SourceBatch, SourceError};
use shopfeed_core::{Attachment, ProductCandidate, ProductRecord, ResolutionStatus};
use shopfeed_storage::{HttpClientConfig, HttpFetcher, ImageResolver, ImageStore};
use shopfeed_sync::{
    prune_catalog, verify_images, FetchScheduler, ImageJob, IngestPipeline, RunConfig,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const IMAGE_BYTES: &[u8] = b"\xff\xd8\xff\xe0 not really a jpeg";

/// Serves `IMAGE_BYTES` for every path except ones containing `missing`, which 404.
async fn spawn_image_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let mut request = Vec::new();
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request_line = String::from_utf8_lossy(&request)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                let (status, body): (&str, &[u8]) = if request_line.contains("missing") {
                    ("404 Not Found", b"")
                } else {
                    ("200 OK", IMAGE_BYTES)
                };
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{addr}"), hits)
}

fn fixture_export(base_url: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/export/sample.xml");
    std::fs::read_to_string(path)
        .unwrap()
        .replace("http://assets.invalid", base_url)
}

fn config_in(root: &Path) -> RunConfig {
    RunConfig {
        export_path: root.join("export.xml"),
        public_dir: root.join("public"),
        catalog_path: root.join("src/data/products.json"),
        workers: 4,
        min_parallel_batch: 1,
        http_timeout_secs: 3,
        ..RunConfig::default()
    }
}

fn read_catalog(path: &Path) -> Vec<ProductRecord> {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

fn resolver_in(root: &Path) -> ImageResolver {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(3),
        ..Default::default()
    })
    .unwrap();
    ImageResolver::new(ImageStore::new(root, "/images/products"), Arc::new(http))
}

#[tokio::test]
async fn ingest_writes_catalog_with_local_images() {
    let (base, hits) = spawn_image_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(&config.export_path, fixture_export(&base)).unwrap();

    let summary = IngestPipeline::new(config.clone())
        .unwrap()
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.source, "export-file");
    assert_eq!(summary.parsed_products, 6);
    assert_eq!(summary.skipped_entries, 3);
    assert_eq!(summary.images_fetched, 3);
    assert_eq!(summary.images_cached, 0);
    assert_eq!(summary.images_placeholder, 3);
    assert_eq!(summary.verified_rewrites, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let catalog = read_catalog(&config.catalog_path);
    let ids: Vec<&str> = catalog.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["201", "202", "203", "204", "205", "207"]);

    let store = config.image_store();
    for record in &catalog {
        assert!(
            store.web_path_exists(&record.img).await,
            "{} points at missing {}",
            record.id,
            record.img
        );
    }

    let by_id: HashMap<&str, &ProductRecord> =
        catalog.iter().map(|r| (r.id.as_str(), r)).collect();
    let earbuds = by_id["201"];
    assert_eq!(earbuds.img, "/images/products/201_Wireless_Bluetooth_Earbuds.png");
    assert_eq!(earbuds.price, "$19.99");
    assert_eq!(earbuds.category, "Audio");
    assert_eq!(earbuds.description, "Premium Wireless Bluetooth Earbuds.");

    let knife = by_id["202"];
    assert_eq!(knife.img, "/images/products/202_Stainless_Steel_Chef_Knife.webp");
    assert_eq!(knife.category, "Kitchen Essentials");
    assert_eq!(knife.price, "Contact for Price");

    assert_eq!(by_id["204"].img, "/images/products/204_Ceramic_Coffee_Mug.jpg");
    assert_eq!(by_id["204"].price, "$8");

    for id in ["203", "205", "207"] {
        assert_eq!(by_id[id].img, "/images/products/placeholder.webp");
    }
    assert_eq!(by_id["203"].category, "General Merchandise");
    assert_eq!(by_id["205"].category, "Bags & Cases");
    assert_eq!(by_id["207"].category, "Electronics Accessories");

    let on_disk = std::fs::read(store.local_path("201_Wireless_Bluetooth_Earbuds.png")).unwrap();
    assert_eq!(on_disk, IMAGE_BYTES);
}

#[tokio::test]
async fn second_run_uses_cache_and_is_byte_identical() {
    let (base, hits) = spawn_image_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(&config.export_path, fixture_export(&base)).unwrap();

    let pipeline = IngestPipeline::new(config.clone()).unwrap();
    let first = pipeline.run_once().await.unwrap();
    let first_bytes = std::fs::read(&config.catalog_path).unwrap();
    let hits_after_first = hits.load(Ordering::SeqCst);

    let second = pipeline.run_once().await.unwrap();
    let second_bytes = std::fs::read(&config.catalog_path).unwrap();

    assert_eq!(first_bytes, second_bytes);
    assert_eq!(first.catalog_sha256, second.catalog_sha256);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(second.images_fetched, 0);
    assert_eq!(second.images_cached, 3);
    assert_eq!(hits.load(Ordering::SeqCst), hits_after_first);
}

#[tokio::test]
async fn sentinel_policy_marks_undeclared_categories() {
    let (base, _hits) = spawn_image_server().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path());
    config.category_policy = shopfeed_core::CategoryPolicy::Sentinel;
    std::fs::write(&config.export_path, fixture_export(&base)).unwrap();

    IngestPipeline::new(config.clone())
        .unwrap()
        .run_once()
        .await
        .unwrap();

    let catalog = read_catalog(&config.catalog_path);
    assert_eq!(catalog[0].category, "Uncategorized");
    assert_eq!(catalog[1].category, "Kitchen Essentials");
}

#[tokio::test]
async fn unreadable_export_aborts_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let err = IngestPipeline::new(config.clone())
        .unwrap()
        .run_once()
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("export-file"));
    assert!(!config.catalog_path.exists());
    assert!(!config.public_dir.exists());
}

#[tokio::test]
async fn malformed_export_aborts_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::write(&config.export_path, "<rss><channel><item></channel>").unwrap();

    let result = IngestPipeline::new(config.clone()).unwrap().run_once().await;

    assert!(result.is_err());
    assert!(!config.catalog_path.exists());
}

#[tokio::test]
async fn failed_crawl_leaves_existing_catalog_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    std::fs::create_dir_all(config.catalog_path.parent().unwrap()).unwrap();
    let existing = serde_json::to_vec_pretty(&vec![record("1", "/images/products/1_a.jpg")]).unwrap();
    std::fs::write(&config.catalog_path, &existing).unwrap();

    let source = ShopCrawlSource::new(
        "http://127.0.0.1:1/shop/page/{page}/",
        2,
        Duration::ZERO,
    );
    let result = IngestPipeline::new(config.clone())
        .unwrap()
        .with_source(Box::new(source))
        .run_once()
        .await;

    assert!(result.is_err());
    assert_eq!(std::fs::read(&config.catalog_path).unwrap(), existing);
}

struct StaticSource(SourceBatch);

#[async_trait]
impl CandidateSource for StaticSource {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn load(&self, _http: &HttpFetcher) -> Result<SourceBatch, SourceError> {
        Ok(self.0.clone())
    }
}

fn static_batch(base: &str, count: usize) -> SourceBatch {
    let mut batch = SourceBatch::default();
    for i in 0..count {
        let id = format!("{}", 1000 + i);
        let url = match i % 3 {
            0 => format!("{base}/img/{id}.jpg"),
            1 => format!("{base}/missing/{id}.jpg"),
            _ => String::new(),
        };
        let thumbnail_ref = if url.is_empty() {
            None
        } else {
            batch.attachments.insert(
                format!("t{id}"),
                Attachment {
                    id: format!("t{id}"),
                    source_url: url,
                },
            );
            Some(format!("t{id}"))
        };
        batch.candidates.push(ProductCandidate {
            id: id.clone(),
            title: format!("Item {i}"),
            declared_category: None,
            thumbnail_ref,
            declared_price: Some("$1".into()),
        });
    }
    batch
}

#[tokio::test]
async fn custom_source_with_partial_failures_keeps_every_record() {
    let (base, _hits) = spawn_image_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());

    let summary = IngestPipeline::new(config.clone())
        .unwrap()
        .with_source(Box::new(StaticSource(static_batch(&base, 30))))
        .run_once()
        .await
        .unwrap();

    assert_eq!(summary.source, "static");
    assert_eq!(summary.parsed_products, 30);
    assert_eq!(summary.images_fetched, 10);
    assert_eq!(summary.images_placeholder, 20);

    let catalog = read_catalog(&config.catalog_path);
    assert_eq!(catalog.len(), 30);
    let ids: Vec<String> = catalog.iter().map(|r| r.id.clone()).collect();
    let expected: Vec<String> = (0..30).map(|i| format!("{}", 1000 + i)).collect();
    assert_eq!(ids, expected);

    let store = config.image_store();
    for record in &catalog {
        assert!(store.web_path_exists(&record.img).await);
    }
    assert_eq!(catalog[0].img, "/images/products/1000_Item_0.jpg");
    assert_eq!(catalog[1].img, "/images/products/placeholder.webp");
}

#[tokio::test]
async fn scheduler_returns_one_result_per_job() {
    let (base, _hits) = spawn_image_server().await;
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver_in(dir.path());
    resolver.store().ensure_placeholder().await.unwrap();

    let jobs: Vec<ImageJob> = (0..25)
        .map(|i| ImageJob {
            key: format!("k{i}"),
            source_url: match i % 5 {
                0 => None,
                1 => Some("http://127.0.0.1:1/unreachable.jpg".to_string()),
                2 => Some(format!("{base}/missing/{i}.jpg")),
                _ => Some(format!("{base}/ok/{i}.jpg")),
            },
            filename: format!("k{i}.jpg"),
        })
        .collect();
    let expected: HashSet<String> = jobs.iter().map(|j| j.key.clone()).collect();

    let results = FetchScheduler::new(4, 1).run(&resolver, jobs).await;

    assert_eq!(results.len(), 25);
    let keys: HashSet<String> = results.iter().map(|r| r.key.clone()).collect();
    assert_eq!(keys, expected);
    let fetched = results
        .iter()
        .filter(|r| r.resolution.status == ResolutionStatus::Fetched)
        .count();
    assert_eq!(fetched, 10);
}

#[tokio::test]
async fn small_batches_run_sequentially() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = resolver_in(dir.path());

    let jobs = vec![
        ImageJob {
            key: "a".into(),
            source_url: None,
            filename: "a.jpg".into(),
        },
        ImageJob {
            key: "b".into(),
            source_url: None,
            filename: "b.jpg".into(),
        },
    ];
    let results = FetchScheduler::new(8, 4).run(&resolver, jobs).await;

    let keys: Vec<&str> = results.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert!(results.iter().all(|r| r.resolution.is_placeholder()));
}

fn record(id: &str, img: &str) -> ProductRecord {
    ProductRecord {
        id: id.to_string(),
        name: format!("Product {id}"),
        price: "$1".into(),
        category: "General Merchandise".into(),
        img: img.to_string(),
        description: format!("Premium Product {id}."),
        features: vec!["Authentic".into(), "Fast Shipping".into()],
    }
}

#[tokio::test]
async fn verify_rewrites_missing_images_to_placeholder() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::new(dir.path(), "/images/products");
    store.ensure_placeholder().await.unwrap();
    std::fs::write(store.local_path("1_kept.jpg"), b"x").unwrap();
    std::fs::write(store.local_path("3_empty.jpg"), b"").unwrap();

    let mut records = vec![
        record("1", "/images/products/1_kept.jpg"),
        record("2", "/images/products/2_gone.jpg"),
        record("3", "/images/products/3_empty.jpg"),
    ];
    let rewritten = verify_images(&mut records, &store).await;

    assert_eq!(rewritten, 2);
    assert_eq!(records[0].img, "/images/products/1_kept.jpg");
    assert_eq!(records[1].img, "/images/products/placeholder.webp");
    assert_eq!(records[2].img, "/images/products/placeholder.webp");
}

#[tokio::test]
async fn prune_drops_records_without_images() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::new(dir.path().join("public"), "/images/products");
    store.ensure_dir().await.unwrap();
    std::fs::write(store.local_path("1_a.jpg"), b"a").unwrap();

    let catalog_path: PathBuf = dir.path().join("products.json");
    let catalog = serde_json::json!([
        { "id": "1", "name": "A", "img": "/images/products/1_a.jpg", "extra": true },
        { "id": "2", "name": "B", "img": "/images/products/2_b.jpg" },
        { "id": "3", "name": "C" }
    ]);
    std::fs::write(&catalog_path, serde_json::to_vec(&catalog).unwrap()).unwrap();

    let summary = prune_catalog(&catalog_path, &store).await.unwrap();
    assert_eq!(summary.before, 3);
    assert_eq!(summary.removed, 2);
    assert_eq!(summary.after, 1);

    let kept: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(&catalog_path).unwrap()).unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0]["id"], "1");
    assert_eq!(kept[0]["extra"], true);
}

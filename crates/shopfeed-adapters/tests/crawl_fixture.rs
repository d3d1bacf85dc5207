use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use shopfeed_adapters::{parse_shop_page, CandidateSource, ShopCrawlSource, SourceError};
use shopfeed_storage::{HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn listing_html() -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/crawl/shop_page.html");
    std::fs::read_to_string(path).expect("read listing fixture")
}

#[test]
fn listing_page_yields_named_products_with_sequential_ids() {
    let products = parse_shop_page(&listing_html(), 1).unwrap();
    let names: Vec<_> = products.iter().map(|p| p.candidate.title.as_str()).collect();
    assert_eq!(names, vec!["Garlic Press", "Desk Clock", "Rain Poncho"]);
    let ids: Vec<_> = products.iter().map(|p| p.candidate.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
}

#[test]
fn listing_page_extracts_images_prices_and_categories() {
    let products = parse_shop_page(&listing_html(), 40).unwrap();

    let garlic = &products[0];
    assert_eq!(
        garlic.image_url.as_deref(),
        Some("https://shop.example.com/uploads/garlic-600x600.jpg")
    );
    assert_eq!(garlic.candidate.declared_price.as_deref(), Some("$9.50"));
    assert_eq!(garlic.candidate.declared_category.as_deref(), Some("Kitchen Tools"));

    let clock = &products[1];
    assert_eq!(
        clock.image_url.as_deref(),
        Some("https://shop.example.com/uploads/desk-clock.png")
    );
    assert_eq!(clock.candidate.declared_price, None);
    assert_eq!(clock.candidate.declared_category, None);

    let poncho = &products[2];
    assert_eq!(poncho.candidate.id, "42");
    assert_eq!(poncho.image_url, None);
    assert_eq!(poncho.candidate.declared_category.as_deref(), Some("Outdoor Gear"));
}

/// Serves the listing fixture for every page except `/shop/page/2/`, which answers 500.
async fn spawn_shop(listing: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let listing: Arc<str> = listing.into();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let listing = listing.clone();
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
                let (status, body) = if request_line.contains("/shop/page/2/") {
                    ("500 Internal Server Error", "")
                } else {
                    ("200 OK", &*listing)
                };
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(3),
        ..Default::default()
    })
    .unwrap()
}

#[tokio::test]
async fn crawl_counts_ids_across_pages_and_skips_failed_ones() {
    let base = spawn_shop(listing_html()).await;
    let source = ShopCrawlSource::new(format!("{base}/shop/page/{{page}}/"), 3, Duration::ZERO);

    let batch = source.load(&fetcher()).await.unwrap();

    let ids: Vec<_> = batch.candidates.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "4", "5", "6"]);
    let titles: Vec<_> = batch.candidates.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(
        titles,
        vec![
            "Garlic Press",
            "Desk Clock",
            "Rain Poncho",
            "Garlic Press",
            "Desk Clock",
            "Rain Poncho"
        ]
    );

    let mut attachment_ids: Vec<_> = batch.attachments.keys().map(String::as_str).collect();
    attachment_ids.sort_unstable();
    assert_eq!(attachment_ids, vec!["crawl-1", "crawl-2", "crawl-4", "crawl-5"]);

    assert_eq!(batch.candidates[0].thumbnail_ref.as_deref(), Some("crawl-1"));
    assert_eq!(
        batch.image_url_for(&batch.candidates[3]),
        Some("https://shop.example.com/uploads/garlic-600x600.jpg")
    );
    assert_eq!(batch.candidates[2].thumbnail_ref, None);
    assert_eq!(batch.image_url_for(&batch.candidates[5]), None);
    assert!(batch.diagnostics.is_empty());
}

#[tokio::test]
async fn crawl_without_any_products_is_an_error() {
    let source = ShopCrawlSource::new("http://127.0.0.1:1/shop/page/{page}/", 2, Duration::ZERO);

    let err = source.load(&fetcher()).await.unwrap_err();
    assert!(matches!(err, SourceError::NoProducts { pages: 2 }));
}

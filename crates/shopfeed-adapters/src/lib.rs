//! Raw product candidate sources: the WXR export reader and the shop listing crawler.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use roxmltree::{Document, Node};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use shopfeed_core::{Attachment, ProductCandidate};
use shopfeed_storage::HttpFetcher;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "shopfeed-adapters";

const WP_NAMESPACE_PREFIX: &str = "http://wordpress.org/export/";
const POST_TYPE_ATTACHMENT: &str = "attachment";
const POST_TYPE_PRODUCT: &str = "product";
const PRODUCT_TAXONOMY: &str = "product_cat";
const META_THUMBNAIL_ID: &str = "_thumbnail_id";
const META_PRICE: &str = "_price";

/// Fatal: the export as a whole cannot be read.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("reading export {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing export XML: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("export has no rss/channel element")]
    MissingChannel,
}

/// Recoverable: a single entry is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EntryIssue {
    #[error("entry has no post type")]
    MissingPostType,
    #[error("entry has no post id")]
    MissingPostId,
    #[error("product has no title")]
    MissingTitle,
    #[error("product id already seen earlier in the export")]
    DuplicateId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryDiagnostic {
    /// 1-based position of the entry in the source.
    pub position: usize,
    pub post_id: Option<String>,
    pub issue: EntryIssue,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("no products found on {pages} listing page(s)")]
    NoProducts { pages: u32 },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Everything one source contributes to an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBatch {
    pub attachments: HashMap<String, Attachment>,
    pub candidates: Vec<ProductCandidate>,
    pub diagnostics: Vec<EntryDiagnostic>,
    pub attachments_without_url: usize,
}

impl SourceBatch {
    /// Remote image URL for a candidate, when its thumbnail reference resolves.
    pub fn image_url_for(&self, candidate: &ProductCandidate) -> Option<&str> {
        candidate
            .thumbnail_ref
            .as_deref()
            .and_then(|id| self.attachments.get(id))
            .map(|attachment| attachment.source_url.as_str())
    }
}

/// Producer of raw product candidates; every implementation feeds the same assembler.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn load(&self, http: &HttpFetcher) -> Result<SourceBatch, SourceError>;
}

fn is_wp_element(node: &Node, local_name: &str) -> bool {
    node.is_element()
        && node.tag_name().name() == local_name
        && node
            .tag_name()
            .namespace()
            .is_some_and(|ns| ns.starts_with(WP_NAMESPACE_PREFIX))
}

fn is_plain_element(node: &Node, local_name: &str) -> bool {
    node.is_element() && node.tag_name().name() == local_name && node.tag_name().namespace().is_none()
}

fn node_text(node: Node) -> Option<String> {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn wp_child_text(item: Node, local_name: &str) -> Option<String> {
    item.children()
        .find(|n| is_wp_element(n, local_name))
        .and_then(node_text)
}

fn plain_child_text(item: Node, local_name: &str) -> Option<String> {
    item.children()
        .find(|n| is_plain_element(n, local_name))
        .and_then(node_text)
}

/// Value of the first `wp:postmeta` whose key matches exactly.
fn meta_value(item: Node, key: &str) -> Option<Option<String>> {
    item.children()
        .filter(|n| is_wp_element(n, "postmeta"))
        .find(|meta| wp_child_text(*meta, "meta_key").as_deref() == Some(key))
        .map(|meta| wp_child_text(meta, "meta_value"))
}

fn first_product_category(item: Node) -> Option<String> {
    item.children()
        .filter(|n| is_plain_element(n, "category"))
        .filter(|n| n.attribute("domain") == Some(PRODUCT_TAXONOMY))
        .find_map(node_text)
}

/// Two-pass read of a WordPress/WooCommerce export document.
pub fn parse_export(xml: &str) -> Result<SourceBatch, ExportError> {
    let document = Document::parse(xml)?;
    let channel = document
        .root_element()
        .children()
        .find(|n| is_plain_element(n, "channel"))
        .ok_or(ExportError::MissingChannel)?;
    let items: Vec<Node> = channel
        .children()
        .filter(|n| is_plain_element(n, "item"))
        .collect();

    let mut batch = SourceBatch::default();

    for (index, item) in items.iter().enumerate() {
        let position = index + 1;
        let post_id = wp_child_text(*item, "post_id");
        let Some(post_type) = wp_child_text(*item, "post_type") else {
            batch.diagnostics.push(EntryDiagnostic {
                position,
                post_id,
                issue: EntryIssue::MissingPostType,
            });
            continue;
        };
        if post_type != POST_TYPE_ATTACHMENT {
            continue;
        }
        let Some(id) = post_id else {
            batch.diagnostics.push(EntryDiagnostic {
                position,
                post_id: None,
                issue: EntryIssue::MissingPostId,
            });
            continue;
        };
        match wp_child_text(*item, "attachment_url") {
            Some(source_url) => {
                batch
                    .attachments
                    .insert(id.clone(), Attachment { id, source_url });
            }
            None => batch.attachments_without_url += 1,
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    for (index, item) in items.iter().enumerate() {
        let position = index + 1;
        if wp_child_text(*item, "post_type").as_deref() != Some(POST_TYPE_PRODUCT) {
            continue;
        }
        let post_id = wp_child_text(*item, "post_id");
        let title = plain_child_text(*item, "title");
        let (id, title) = match (post_id, title) {
            (Some(id), Some(title)) if !seen.contains(&id) => (id, title),
            (post_id, title) => {
                let issue = match (&post_id, title) {
                    (None, _) => EntryIssue::MissingPostId,
                    (Some(_), None) => EntryIssue::MissingTitle,
                    (Some(_), Some(_)) => EntryIssue::DuplicateId,
                };
                batch.diagnostics.push(EntryDiagnostic {
                    position,
                    post_id,
                    issue,
                });
                continue;
            }
        };
        seen.insert(id.clone());

        let declared_price = meta_value(*item, META_PRICE)
            .flatten()
            .map(|value| format!("${value}"));

        batch.candidates.push(ProductCandidate {
            id,
            title,
            declared_category: first_product_category(*item),
            thumbnail_ref: meta_value(*item, META_THUMBNAIL_ID).flatten(),
            declared_price,
        });
    }

    batch.diagnostics.sort_by_key(|d| d.position);
    Ok(batch)
}

/// Reads a WXR export file from disk.
#[derive(Debug, Clone)]
pub struct ExportFileSource {
    path: PathBuf,
}

impl ExportFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CandidateSource for ExportFileSource {
    fn source_id(&self) -> &'static str {
        "export-file"
    }

    async fn load(&self, _http: &HttpFetcher) -> Result<SourceBatch, SourceError> {
        let xml = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ExportError::Read {
                path: self.path.clone(),
                source,
            })?;
        let batch = parse_export(&xml)?;
        for diagnostic in &batch.diagnostics {
            warn!(
                position = diagnostic.position,
                post_id = diagnostic.post_id.as_deref().unwrap_or("-"),
                issue = %diagnostic.issue,
                "skipping export entry"
            );
        }
        info!(
            path = %self.path.display(),
            attachments = batch.attachments.len(),
            products = batch.candidates.len(),
            skipped = batch.diagnostics.len(),
            "export parsed"
        );
        Ok(batch)
    }
}

/// One product node scraped from a shop listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledProduct {
    pub candidate: ProductCandidate,
    pub image_url: Option<String>,
}

fn selector(raw: &str) -> Result<Selector, SourceError> {
    Selector::parse(raw).map_err(|e| SourceError::Selector {
        selector: raw.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(element: &ElementRef, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Largest `srcset` candidate, then `data-src`, then `src`.
fn image_source(img: ElementRef) -> Option<String> {
    let attrs = img.value();
    let from_srcset = attrs.attr("srcset").and_then(|srcset| {
        srcset
            .split(',')
            .filter_map(|entry| entry.split_whitespace().next())
            .last()
            .map(ToString::to_string)
    });
    from_srcset
        .or_else(|| attrs.attr("data-src").and_then(|s| text_or_none(s.to_string())))
        .or_else(|| attrs.attr("src").and_then(|s| text_or_none(s.to_string())))
}

fn title_case(slug: &str) -> String {
    slug.split(|c: char| c == '-' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    let mut word: String = first.to_uppercase().collect();
                    word.push_str(&chars.as_str().to_lowercase());
                    word
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses one listing page; ids are assigned sequentially from `first_id`.
pub fn parse_shop_page(html: &str, first_id: usize) -> Result<Vec<CrawledProduct>, SourceError> {
    let document = Html::parse_document(html);
    let mut nodes = Vec::new();
    for raw in [".product", "li.product", ".type-product"] {
        nodes = document.select(&selector(raw)?).collect::<Vec<_>>();
        if !nodes.is_empty() {
            break;
        }
    }

    let loop_title = selector(".woocommerce-loop-product__title")?;
    let heading = selector("h2")?;
    let price = selector(".price")?;
    let img = selector("img")?;

    let mut next_id = first_id;
    let mut products = Vec::new();
    for node in nodes {
        let Some(name) = select_first_text(&node, &loop_title).or_else(|| select_first_text(&node, &heading))
        else {
            debug!("listing node without a product name; skipping");
            continue;
        };
        let id = next_id.to_string();
        next_id += 1;

        let category = node
            .value()
            .attr("class")
            .unwrap_or_default()
            .split_whitespace()
            .find_map(|class| class.strip_prefix("product_cat-"))
            .map(title_case)
            .filter(|c| !c.is_empty());
        let image_url = node.select(&img).next().and_then(image_source);

        products.push(CrawledProduct {
            candidate: ProductCandidate {
                id,
                title: name,
                declared_category: category,
                thumbnail_ref: None,
                declared_price: select_first_text(&node, &price),
            },
            image_url,
        });
    }
    Ok(products)
}

/// Paginated crawl of a live shop listing, with a polite delay between pages.
#[derive(Debug, Clone)]
pub struct ShopCrawlSource {
    page_url_template: String,
    pages: u32,
    polite_delay: Duration,
}

impl ShopCrawlSource {
    /// `page_url_template` must contain `{page}`, e.g. `https://shop.example.com/shop/page/{page}/`.
    pub fn new(page_url_template: impl Into<String>, pages: u32, polite_delay: Duration) -> Self {
        Self {
            page_url_template: page_url_template.into(),
            pages,
            polite_delay,
        }
    }

    pub fn page_url(&self, page: u32) -> String {
        self.page_url_template.replace("{page}", &page.to_string())
    }
}

#[async_trait]
impl CandidateSource for ShopCrawlSource {
    fn source_id(&self) -> &'static str {
        "shop-crawl"
    }

    async fn load(&self, http: &HttpFetcher) -> Result<SourceBatch, SourceError> {
        if !self.page_url_template.contains("{page}") {
            warn!(template = %self.page_url_template, "page template has no {{page}} marker");
        }
        let mut batch = SourceBatch::default();
        let mut next_id = 1usize;

        for page in 1..=self.pages {
            let url = self.page_url(page);
            match http.fetch_bytes(&url).await {
                Ok(resp) => {
                    let html = String::from_utf8_lossy(&resp.body);
                    let products = parse_shop_page(&html, next_id)?;
                    info!(
                        page,
                        found = products.len(),
                        status = %resp.status,
                        url = %resp.final_url,
                        "listing page parsed"
                    );
                    next_id += products.len();
                    for product in products {
                        let mut candidate = product.candidate;
                        if let Some(source_url) = product.image_url {
                            let attachment_id = format!("crawl-{}", candidate.id);
                            candidate.thumbnail_ref = Some(attachment_id.clone());
                            batch.attachments.insert(
                                attachment_id.clone(),
                                Attachment {
                                    id: attachment_id,
                                    source_url,
                                },
                            );
                        }
                        batch.candidates.push(candidate);
                    }
                }
                Err(err) => warn!(page, %url, error = %err, "listing page failed; skipping"),
            }

            if page < self.pages && !self.polite_delay.is_zero() {
                tokio::time::sleep(self.polite_delay).await;
            }
        }

        if batch.candidates.is_empty() {
            return Err(SourceError::NoProducts { pages: self.pages });
        }
        Ok(batch)
    }
}

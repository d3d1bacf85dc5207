//! Core catalog model and category classification for shopfeed.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "shopfeed-core";

/// File name of the shared fallback image inside the image store.
pub const PLACEHOLDER_FILENAME: &str = "placeholder.webp";
/// Web path every record falls back to when no usable image exists.
pub const PLACEHOLDER_WEB_PATH: &str = "/images/products/placeholder.webp";
pub const PRICE_ON_REQUEST: &str = "Contact for Price";
pub const UNCATEGORIZED: &str = "Uncategorized";
pub const DEFAULT_CATEGORY: &str = "General Merchandise";
pub const DEFAULT_FEATURES: [&str; 2] = ["Authentic", "Fast Shipping"];

/// Media entry from the export, looked up by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub source_url: String,
}

/// Product entry extracted from a source before image resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCandidate {
    pub id: String,
    pub title: String,
    pub declared_category: Option<String>,
    pub thumbnail_ref: Option<String>,
    /// Already formatted for display (`$12.50`); `None` renders as [`PRICE_ON_REQUEST`].
    pub declared_price: Option<String>,
}

impl ProductCandidate {
    pub fn price_label(&self) -> String {
        self.declared_price
            .clone()
            .unwrap_or_else(|| PRICE_ON_REQUEST.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStatus {
    Cached,
    Fetched,
    Fallback,
}

/// Outcome of resolving one remote image into the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResolution {
    pub local_filename: String,
    /// Web-relative path recorded in the catalog.
    pub local_path: String,
    pub status: ResolutionStatus,
}

impl ImageResolution {
    pub fn placeholder(web_path: impl Into<String>) -> Self {
        Self {
            local_filename: PLACEHOLDER_FILENAME.to_string(),
            local_path: web_path.into(),
            status: ResolutionStatus::Fallback,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.status == ResolutionStatus::Fallback
    }
}

/// One element of the persisted catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub name: String,
    pub price: String,
    pub category: String,
    pub img: String,
    pub description: String,
    pub features: Vec<String>,
}

pub type Catalog = Vec<ProductRecord>;

pub fn describe(title: &str) -> String {
    format!("Premium {title}.")
}

pub fn default_features() -> Vec<String> {
    DEFAULT_FEATURES.iter().map(|f| f.to_string()).collect()
}

/// How a category is chosen when the source declares none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryPolicy {
    /// Run the keyword classifier over the title.
    #[default]
    Classify,
    /// Emit the fixed [`UNCATEGORIZED`] label.
    Sentinel,
}

impl std::str::FromStr for CategoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classify" => Ok(Self::Classify),
            "sentinel" | "uncategorized" => Ok(Self::Sentinel),
            other => Err(format!("unknown category policy `{other}`")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    pub category: String,
    pub contains_any: Vec<String>,
}

/// Ordered keyword table; the first rule with a matching keyword wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRules {
    pub rules: Vec<CategoryRule>,
    #[serde(default = "default_category")]
    pub default: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn rule(category: &str, keywords: &[&str]) -> CategoryRule {
    CategoryRule {
        category: category.to_string(),
        contains_any: keywords.iter().map(|k| k.to_string()).collect(),
    }
}

impl Default for CategoryRules {
    fn default() -> Self {
        Self {
            rules: vec![
                rule(
                    "Audio",
                    &["earbud", "headphone", "speaker", "audio", "sound", "mic", "radio"],
                ),
                rule(
                    "Electronics Accessories",
                    &["adapter", "plug", "cable", "charger", "usb", "power", "battery"],
                ),
                rule(
                    "Kitchenware",
                    &["kitchen", "cook", "pan", "pot", "knife", "blender", "grill", "maker"],
                ),
                rule("Toys & Games", &["toy", "game", "puzzle", "doll", "car"]),
                rule("Bags & Cases", &["bag", "case", "backpack", "tote", "luggage"]),
                rule("Clocks & Watches", &["watch", "clock", "alarm"]),
            ],
            default: default_category(),
        }
    }
}

impl CategoryRules {
    /// Case-insensitive substring match, evaluated top to bottom.
    pub fn classify(&self, title: &str) -> &str {
        let title = title.to_lowercase();
        self.rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| title.contains(&needle.to_lowercase()))
            })
            .map(|rule| rule.category.as_str())
            .unwrap_or(&self.default)
    }
}

/// Classifies with the built-in rule table.
pub fn classify(title: &str) -> String {
    CategoryRules::default().classify(title).to_string()
}

/// Declared category wins; otherwise the policy decides.
pub fn resolve_category(
    declared: Option<&str>,
    title: &str,
    policy: CategoryPolicy,
    rules: &CategoryRules,
) -> String {
    match declared.map(str::trim).filter(|c| !c.is_empty()) {
        Some(category) => category.to_string(),
        None => match policy {
            CategoryPolicy::Classify => rules.classify(title).to_string(),
            CategoryPolicy::Sentinel => UNCATEGORIZED.to_string(),
        },
    }
}

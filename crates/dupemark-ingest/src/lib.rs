//! Ingestion collaborators: fixture-first listing sources for the detector.
//!
//! Browser automation stays outside this repo; sources here parse captured
//! page bundles (JSON or HTML) into flat `Listing` records. Every extracted
//! field is optional and collapses to a documented default instead of
//! failing the record.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dupemark_core::Listing;
use dupemark_storage::{AssetFetcher, FetchError};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dupemark-ingest";

/// Default for absent seller fields, matching what the platform shows for
/// anonymized sellers.
pub const MISSING_SELLER: &str = "N/A";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Message(String),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Captured page bundle handed from the crawler to a listing source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingBundle {
    pub bundle_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub extractor_version: String,
    pub raw_artifact: RawArtifact,
    #[serde(default)]
    pub records: Vec<RawListingRecord>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawArtifact {
    pub content_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
}

/// One extracted listing before defaults are applied. Absent fields are
/// "not present on the page", never errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawListingRecord {
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub seller_name: Option<String>,
    #[serde(default)]
    pub seller_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

impl RawListingRecord {
    /// Collapse to a `Listing` with documented defaults: text fields become
    /// empty strings, seller fields become `"N/A"`, and a missing platform
    /// id becomes a deterministic v5 id so re-ingesting the same capture
    /// cannot mint a second identity.
    pub fn into_listing(self, bundle: &ListingBundle) -> Listing {
        let item_id = self
            .item_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| {
                synthesized_item_id(
                    &bundle.source_id,
                    self.listing_url
                        .as_deref()
                        .unwrap_or(&bundle.captured_from_url),
                )
            });
        Listing {
            item_id,
            seller_id: self.seller_id.unwrap_or_else(|| MISSING_SELLER.to_string()),
            seller_name: self
                .seller_name
                .unwrap_or_else(|| MISSING_SELLER.to_string()),
            title: self.title.unwrap_or_default(),
            description: self.description.unwrap_or_default(),
            category: self.category.unwrap_or_default(),
            price: self.price.unwrap_or_default(),
            image_urls: self.image_urls,
            created_at: bundle.fetched_at,
        }
    }
}

pub fn synthesized_item_id(source_id: &str, url: &str) -> String {
    let seed = format!("{source_id}:{url}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
}

/// Explicitly owned ingest session, acquired at the start of a run and
/// released at its end. Sources borrow it; nothing about the session is
/// process-global.
pub struct IngestSession {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    http: Arc<AssetFetcher>,
}

impl IngestSession {
    pub fn acquire(http: Arc<AssetFetcher>) -> Self {
        let session = Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            http,
        };
        info!(run_id = %session.run_id, "ingest session acquired");
        session
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn http(&self) -> &AssetFetcher {
        &self.http
    }

    pub fn release(self) {
        info!(run_id = %self.run_id, "ingest session released");
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

/// A place listings come from: knows how to fetch raw pages within a
/// session and how to parse a captured bundle into listings.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(
        &self,
        session: &IngestSession,
        targets: &[ListingTarget],
    ) -> Result<Vec<FetchedPage>, IngestError>;

    fn parse(&self, bundle: &ListingBundle) -> Result<Vec<Listing>, IngestError>;
}

fn check_bundle_source(bundle: &ListingBundle, source_id: &str) -> Result<(), IngestError> {
    if bundle.source_id != source_id {
        return Err(IngestError::Message(format!(
            "bundle source_id={} does not match source source_id={}",
            bundle.source_id, source_id
        )));
    }
    Ok(())
}

/// Source whose bundles already carry structured records.
#[derive(Debug, Clone, Copy)]
pub struct JsonFixtureSource {
    pub source_id: &'static str,
}

#[async_trait]
impl ListingSource for JsonFixtureSource {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn fetch(
        &self,
        _session: &IngestSession,
        _targets: &[ListingTarget],
    ) -> Result<Vec<FetchedPage>, IngestError> {
        Ok(Vec::new())
    }

    fn parse(&self, bundle: &ListingBundle) -> Result<Vec<Listing>, IngestError> {
        check_bundle_source(bundle, self.source_id)?;
        Ok(bundle
            .records
            .iter()
            .cloned()
            .map(|record| record.into_listing(bundle))
            .collect())
    }
}

const DEEPLINK_SELECTOR: &str = r#"meta[name="branch:deeplink:$deeplink_path"]"#;
const TITLE_SELECTOR: &str = r#"h1[data-testid$="text-title"]"#;
const DESCRIPTION_SELECTOR: &str = "#FieldSetField-Container-field_description p";
const PRICE_SELECTOR: &str = "#FieldSetField-Container-field_price h3";
const CATEGORY_SELECTOR: &str = r#"a[href^="/categories/"] span"#;
const PHOTO_SELECTOR: &str = "#FieldSetField-Container-field_photo_viewer button img";
const SELLER_SELECTOR: &str = r#"div[data-testid$="seller-contact-header"] a span"#;

/// Source whose bundles carry a captured detail-page HTML artifact.
#[derive(Debug, Clone, Copy)]
pub struct HtmlListingSource {
    pub source_id: &'static str,
}

#[async_trait]
impl ListingSource for HtmlListingSource {
    fn source_id(&self) -> &'static str {
        self.source_id
    }

    async fn fetch(
        &self,
        session: &IngestSession,
        targets: &[ListingTarget],
    ) -> Result<Vec<FetchedPage>, IngestError> {
        let mut pages = Vec::new();
        for target in targets {
            match session.http().fetch_bytes(session.run_id(), &target.url).await {
                Ok(asset) => pages.push(FetchedPage {
                    url: asset.final_url,
                    content_type: "text/html".to_string(),
                    body: asset.body,
                    fetched_at: Utc::now(),
                }),
                Err(err) => {
                    warn!(url = %target.url, error = %err, "skipping unreachable listing page");
                }
            }
        }
        Ok(pages)
    }

    fn parse(&self, bundle: &ListingBundle) -> Result<Vec<Listing>, IngestError> {
        check_bundle_source(bundle, self.source_id)?;
        let Some(html_text) = bundle.raw_artifact.inline_text.as_deref() else {
            // No captured page; fall back to whatever structured records came along.
            return Ok(bundle
                .records
                .iter()
                .cloned()
                .map(|record| record.into_listing(bundle))
                .collect());
        };

        let document = Html::parse_document(html_text);
        let mut record = bundle.records.first().cloned().unwrap_or_default();

        if let Some(content) = select_first_attr(&document, DEEPLINK_SELECTOR, "content")? {
            if let Some(number) = extract_item_number(&content) {
                record.item_id = Some(number);
            }
        }
        if let Some(title) = select_first_text(&document, TITLE_SELECTOR)? {
            record.title = Some(title);
        }
        if let Some(description) = select_first_text(&document, DESCRIPTION_SELECTOR)? {
            record.description = Some(description);
        }
        if let Some(price) = select_first_text(&document, PRICE_SELECTOR)? {
            record.price = Some(price);
        }
        if let Some(category) = select_first_text(&document, CATEGORY_SELECTOR)? {
            record.category = Some(category);
        }
        let seller_spans = select_all_texts(&document, SELLER_SELECTOR)?;
        if let Some(name) = seller_spans.first() {
            record.seller_name = Some(name.clone());
        }
        if let Some(id) = seller_spans.get(1) {
            record.seller_id = Some(id.clone());
        }
        let photos = select_all_attrs(&document, PHOTO_SELECTOR, "src")?;
        if !photos.is_empty() {
            record.image_urls = photos;
        }

        Ok(vec![record.into_listing(bundle)])
    }
}

/// Item numbers are embedded in the deeplink meta tag as `/p/<digits>`.
fn extract_item_number(content: &str) -> Option<String> {
    let idx = content.find("/p/")?;
    let digits: String = content[idx + 3..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, IngestError> {
    let sel = Selector::parse(selector).map_err(|e| IngestError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(document: &Html, selector: &str) -> Result<Vec<String>, IngestError> {
    let sel = Selector::parse(selector).map_err(|e| IngestError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, IngestError> {
    let sel = Selector::parse(selector).map_err(|e| IngestError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_attrs(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Vec<String>, IngestError> {
    let sel = Selector::parse(selector).map_err(|e| IngestError::Message(e.to_string()))?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

/// Registered sources, by source id.
pub fn source_for(source_id: &str) -> Option<Box<dyn ListingSource>> {
    match source_id {
        "carousell-my" => Some(Box::new(HtmlListingSource {
            source_id: "carousell-my",
        })),
        "demo-market" => Some(Box::new(JsonFixtureSource {
            source_id: "demo-market",
        })),
        _ => None,
    }
}

pub fn load_listing_bundle(path: impl AsRef<Path>) -> Result<ListingBundle, IngestError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)
        .map_err(|e| IngestError::Message(format!("reading {}: {e}", path.display())))?;
    let mut bundle: ListingBundle = serde_json::from_str(&data)
        .map_err(|e| IngestError::Message(format!("parsing {}: {e}", path.display())))?;
    hydrate_inline_raw_artifact(path, &mut bundle)?;
    Ok(bundle)
}

fn hydrate_inline_raw_artifact(
    bundle_path: &Path,
    bundle: &mut ListingBundle,
) -> Result<(), IngestError> {
    if bundle.raw_artifact.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &bundle.raw_artifact.path else {
        return Ok(());
    };
    let raw_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    if !raw_path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(&raw_path)
        .map_err(|e| IngestError::Message(format!("reading {}: {e}", raw_path.display())))?;
    bundle.raw_artifact.inline_text = Some(raw);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dupemark_storage::FetcherConfig;

    fn mk_bundle(source_id: &str) -> ListingBundle {
        ListingBundle {
            bundle_id: "sample-1".to_string(),
            source_id: source_id.to_string(),
            captured_from_url: "https://market.example/p/900100".to_string(),
            fetched_at: Utc::now(),
            extractor_version: "test".to_string(),
            raw_artifact: RawArtifact {
                content_type: "text/html".to_string(),
                path: None,
                inline_text: None,
            },
            records: Vec::new(),
            notes: None,
        }
    }

    #[test]
    fn absent_fields_collapse_to_documented_defaults() {
        let bundle = mk_bundle("demo-market");
        let listing = RawListingRecord {
            item_id: Some("900100".to_string()),
            ..Default::default()
        }
        .into_listing(&bundle);

        assert_eq!(listing.item_id, "900100");
        assert_eq!(listing.seller_name, MISSING_SELLER);
        assert_eq!(listing.seller_id, MISSING_SELLER);
        assert_eq!(listing.title, "");
        assert_eq!(listing.description, "");
        assert_eq!(listing.category, "");
        assert_eq!(listing.price, "");
        assert!(listing.image_urls.is_empty());
    }

    #[test]
    fn missing_item_id_gets_stable_synthesized_id() {
        let bundle = mk_bundle("demo-market");
        let first = RawListingRecord::default().into_listing(&bundle);
        let second = RawListingRecord::default().into_listing(&bundle);
        assert_eq!(first.item_id, second.item_id);
        assert_ne!(
            first.item_id,
            synthesized_item_id("other-source", &bundle.captured_from_url)
        );
    }

    #[test]
    fn item_number_comes_from_deeplink_path() {
        assert_eq!(
            extract_item_number("carousell://listing/p/123456789?x=1"),
            Some("123456789".to_string())
        );
        assert_eq!(extract_item_number("carousell://home"), None);
        assert_eq!(extract_item_number("/p/"), None);
    }

    #[test]
    fn html_source_extracts_listing_fields() {
        let html = r##"
        <html><head>
          <meta name="branch:deeplink:$deeplink_path" content="listing/p/900123/">
        </head><body>
          <div data-testid="page-div-seller-contact-header">
            <a href="/u/one"><span>Ahmad Trading</span><span>@ahmadtrading</span></a>
          </div>
          <h1 data-testid="page-text-title">iPhone 13 128GB</h1>
          <div id="FieldSetField-Container-field_price"><h3>RM 2,100</h3></div>
          <div id="FieldSetField-Container-field_description"><p>Like new, full box</p></div>
          <a href="/categories/mobile-phones"><span>Mobile Phones</span></a>
          <div id="FieldSetField-Container-field_photo_viewer">
            <button><img src="https://img.example/1.jpg"></button>
            <button><img src="https://img.example/2.jpg"></button>
          </div>
        </body></html>
        "##;

        let mut bundle = mk_bundle("carousell-my");
        bundle.raw_artifact.inline_text = Some(html.to_string());

        let source = HtmlListingSource {
            source_id: "carousell-my",
        };
        let listings = source.parse(&bundle).expect("parse");
        assert_eq!(listings.len(), 1);
        let listing = &listings[0];
        assert_eq!(listing.item_id, "900123");
        assert_eq!(listing.title, "iPhone 13 128GB");
        assert_eq!(listing.description, "Like new, full box");
        assert_eq!(listing.price, "RM 2,100");
        assert_eq!(listing.category, "Mobile Phones");
        assert_eq!(listing.seller_name, "Ahmad Trading");
        assert_eq!(listing.seller_id, "@ahmadtrading");
        assert_eq!(listing.image_urls.len(), 2);
    }

    #[test]
    fn bundle_source_mismatch_is_rejected() {
        let bundle = mk_bundle("somewhere-else");
        let source = JsonFixtureSource {
            source_id: "demo-market",
        };
        assert!(source.parse(&bundle).is_err());
    }

    #[test]
    fn registry_knows_its_sources() {
        assert!(source_for("carousell-my").is_some());
        assert!(source_for("demo-market").is_some());
        assert!(source_for("nope").is_none());
    }

    #[tokio::test]
    async fn fixture_sources_do_not_fetch() {
        let http = Arc::new(AssetFetcher::new(FetcherConfig::default()).expect("fetcher"));
        let session = IngestSession::acquire(http);
        let source = JsonFixtureSource {
            source_id: "demo-market",
        };
        let pages = source
            .fetch(
                &session,
                &[ListingTarget {
                    url: "https://market.example/p/1".to_string(),
                }],
            )
            .await
            .expect("fetch");
        assert!(pages.is_empty());
        session.release();
    }
}

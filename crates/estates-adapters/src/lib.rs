//! Listing source contracts: record parser, page fetchers and fixture loading.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use estates_core::{
    Amenities, LayoutCode, NormalizedListing, PropertyKind, CATEGORY_MAIN_APARTMENT,
    CATEGORY_MAIN_HOUSE, CATEGORY_TYPE_SALE, SENTINEL_PRICE,
};
use estates_storage::{FetchError, HttpClientConfig, HttpFetcher};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "estates-adapters";

pub const SREALITY_ESTATES_URL: &str = "https://www.sreality.cz/api/cs/v2/estates";

/// Inputs the parser needs besides the raw record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseContext {
    pub captured_on: NaiveDate,
}

/// Why a raw record did not become a [`NormalizedListing`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("not a sale listing (category_type_cb={0:?})")]
    NotForSale(Option<i64>),
    #[error("unsupported property class (category_main_cb={0:?})")]
    UnsupportedClass(Option<i64>),
    #[error("sentinel price")]
    SentinelPrice,
    #[error("malformed record: {0}")]
    Malformed(String),
}

impl Rejection {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotForSale(_) => "not_for_sale",
            Self::UnsupportedClass(_) => "unsupported_class",
            Self::SentinelPrice => "sentinel_price",
            Self::Malformed(_) => "malformed",
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSeo {
    pub category_main_cb: Option<i64>,
    pub category_sub_cb: Option<i64>,
    pub category_type_cb: Option<i64>,
    pub locality: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawGps {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// `hash_id` arrives as a JSON number from the API but as text from replays.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(Number),
    Text(String),
}

impl RawId {
    fn into_key(self) -> String {
        match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        }
    }
}

/// One element of the API's `_embedded.estates` array.
#[derive(Debug, Clone, Deserialize)]
pub struct RawListing {
    pub seo: Option<RawSeo>,
    pub hash_id: Option<RawId>,
    pub name: Option<String>,
    pub price: Option<Number>,
    pub is_auction: Option<bool>,
    pub gps: Option<RawGps>,
    #[serde(rename = "labelsAll")]
    pub labels_all: Option<Vec<Vec<String>>>,
}

/// Structured fields pulled out of a listing title.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TitleFields {
    /// Every `<number> m²` occurrence, in order of appearance.
    pub sizes: Vec<u32>,
    pub layout: Option<LayoutCode>,
    pub comment: Option<String>,
}

fn size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([0-9]+)\s*m²").expect("size pattern"))
}

fn layout_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d\+\w+)").expect("layout pattern"))
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^)]+)\)").expect("comment pattern"))
}

pub fn extract_title_fields(title: &str) -> Result<TitleFields, String> {
    let sizes = size_re()
        .captures_iter(title)
        .map(|caps| {
            let digits = &caps[1];
            digits
                .parse::<u32>()
                .map_err(|_| format!("size `{digits}` in title is not a valid area"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let layout = layout_re()
        .captures(title)
        .and_then(|caps| LayoutCode::from_token(&caps[1]));
    let comment = comment_re()
        .captures(title)
        .map(|caps| caps[1].to_string());
    Ok(TitleFields {
        sizes,
        layout,
        comment,
    })
}

fn price_value(price: &Number) -> Option<f64> {
    price.as_i64().map(|v| v as f64).or_else(|| price.as_f64())
}

fn integral_price(price: &Number) -> Option<i64> {
    if let Some(v) = price.as_i64() {
        return Some(v);
    }
    let f = price.as_f64()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

impl RawListing {
    pub fn normalize(self, ctx: &ParseContext) -> Result<NormalizedListing, Rejection> {
        let seo = self.seo.unwrap_or_default();

        if seo.category_type_cb != Some(CATEGORY_TYPE_SALE) {
            return Err(Rejection::NotForSale(seo.category_type_cb));
        }
        let is_house = match seo.category_main_cb {
            Some(CATEGORY_MAIN_APARTMENT) => false,
            Some(CATEGORY_MAIN_HOUSE) => true,
            other => return Err(Rejection::UnsupportedClass(other)),
        };
        if self
            .price
            .as_ref()
            .and_then(price_value)
            .is_some_and(|p| p == SENTINEL_PRICE as f64)
        {
            return Err(Rejection::SentinelPrice);
        }

        let id = self
            .hash_id
            .map(RawId::into_key)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Rejection::Malformed("missing hash_id".to_string()))?;
        let price_czk = match &self.price {
            None => return Err(Rejection::Malformed(format!("listing {id} has no price"))),
            Some(p) => integral_price(p).ok_or_else(|| {
                Rejection::Malformed(format!("listing {id} has non-integer price {p}"))
            })?,
        };
        let title = self.name.unwrap_or_else(|| "Unnamed".to_string());
        let fields = extract_title_fields(&title)
            .map_err(|reason| Rejection::Malformed(format!("listing {id}: {reason}")))?;
        let gps = self.gps.unwrap_or_default();
        let amenities = Amenities::from_labels(
            self.labels_all
                .iter()
                .flatten()
                .flatten()
                .map(String::as_str),
        );

        let kind = if is_house {
            PropertyKind::House {
                subclass: seo.category_sub_cb,
                land_area_m2: fields.sizes.get(1).copied(),
            }
        } else {
            PropertyKind::Apartment
        };

        Ok(NormalizedListing {
            id,
            title,
            price_czk,
            captured_on: ctx.captured_on,
            is_auction: self.is_auction.unwrap_or(false),
            latitude: gps.lat,
            longitude: gps.lon,
            kind,
            area_m2: fields.sizes.first().copied(),
            layout: fields.layout,
            comment: fields.comment,
            amenities,
        })
    }
}

/// Map one raw API record to a normalized listing or a rejection reason.
pub fn parse_listing(raw: &JsonValue, ctx: &ParseContext) -> Result<NormalizedListing, Rejection> {
    let listing =
        RawListing::deserialize(raw).map_err(|e| Rejection::Malformed(e.to_string()))?;
    listing.normalize(ctx)
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching page {page}: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("page {page}: unexpected response shape: {message}")]
    Shape { page: u32, message: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One page of raw records, still undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub page: u32,
    pub records: Vec<JsonValue>,
}

impl RawPage {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fetch one page (1-based). Failures are returned, never retried.
    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<RawPage, AdapterError>;
}

/// Pull the `_embedded.estates` array out of an API response; a missing key means no records.
pub fn extract_estates(page: u32, response: JsonValue) -> Result<RawPage, AdapterError> {
    let JsonValue::Object(mut root) = response else {
        return Err(AdapterError::Shape {
            page,
            message: "response is not a JSON object".to_string(),
        });
    };
    let records = match root
        .get_mut("_embedded")
        .and_then(|embedded| embedded.get_mut("estates"))
        .map(JsonValue::take)
    {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items,
        Some(_) => {
            return Err(AdapterError::Shape {
                page,
                message: "_embedded.estates is not an array".to_string(),
            })
        }
    };
    Ok(RawPage { page, records })
}

/// Header set the estates API expects from a browser-like client.
pub fn browser_headers() -> Vec<(String, String)> {
    [
        ("Accept", "application/json"),
        ("Accept-Language", "cs-CZ,cs;q=0.9"),
        ("Referer", "https://www.sreality.cz/"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Query string for one page of sale listings.
pub fn page_query(page: u32, per_page: u32) -> [(&'static str, String); 3] {
    [
        ("category_type_cb", CATEGORY_TYPE_SALE.to_string()),
        ("page", page.to_string()),
        ("per_page", per_page.to_string()),
    ]
}

#[derive(Debug, Clone)]
pub struct SrealityFetcher {
    http: HttpFetcher,
    endpoint: String,
}

impl SrealityFetcher {
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn from_config(
        endpoint: impl Into<String>,
        user_agent: &str,
        timeout: std::time::Duration,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            user_agent: Some(user_agent.to_string()),
            default_headers: browser_headers(),
        })?;
        Ok(Self::new(http, endpoint))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PageFetcher for SrealityFetcher {
    fn source_id(&self) -> &'static str {
        "sreality"
    }

    async fn fetch_page(&self, page: u32, per_page: u32) -> Result<RawPage, AdapterError> {
        let query = page_query(page, per_page);
        let response = self
            .http
            .fetch_json(&self.endpoint, &query)
            .await
            .map_err(|source| AdapterError::Fetch { page, source })?;
        let raw = extract_estates(page, response)?;
        debug!(page, records = raw.records.len(), "page decoded");
        Ok(raw)
    }
}

/// Serves pre-recorded pages; pages past the end are empty.
#[derive(Debug, Clone, Default)]
pub struct StaticPageFetcher {
    pages: Vec<Result<Vec<JsonValue>, String>>,
}

impl StaticPageFetcher {
    pub fn new(pages: Vec<Vec<JsonValue>>) -> Self {
        Self {
            pages: pages.into_iter().map(Ok).collect(),
        }
    }

    /// Make the given 1-based page fail with `message`.
    pub fn with_failure(mut self, page: u32, message: impl Into<String>) -> Self {
        let idx = page.saturating_sub(1) as usize;
        if self.pages.len() <= idx {
            self.pages.resize(idx + 1, Ok(Vec::new()));
        }
        self.pages[idx] = Err(message.into());
        self
    }

    /// Load `page_<n>.json` API responses from a directory, ordered by `n`.
    pub fn from_fixture_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut numbered = BTreeMap::new();
        for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            if let Some(n) = stem.strip_prefix("page_").and_then(|n| n.parse::<u32>().ok()) {
                if is_json && n > 0 {
                    numbered.insert(n, path);
                }
            }
        }

        let mut pages = Vec::new();
        for (n, path) in numbered {
            if n as usize != pages.len() + 1 {
                anyhow::bail!("fixture pages in {} are not contiguous at page {n}", dir.display());
            }
            let response: JsonValue = read_json_file(&path)?;
            let raw = extract_estates(n, response)
                .with_context(|| format!("decoding {}", path.display()))?;
            pages.push(Ok(raw.records));
        }
        Ok(Self { pages })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[async_trait]
impl PageFetcher for StaticPageFetcher {
    fn source_id(&self) -> &'static str {
        "static"
    }

    async fn fetch_page(&self, page: u32, _per_page: u32) -> Result<RawPage, AdapterError> {
        let idx = page.saturating_sub(1) as usize;
        match self.pages.get(idx) {
            None => Ok(RawPage {
                page,
                records: Vec::new(),
            }),
            Some(Ok(records)) => Ok(RawPage {
                page,
                records: records.clone(),
            }),
            Some(Err(message)) => Err(AdapterError::Message(format!("page {page}: {message}"))),
        }
    }
}

pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

//! Dataset persistence + HTTP fetch utilities for the listing harvester.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use estates_core::{
    Amenities, LayoutCode, NormalizedListing, PropertyKind, CATEGORY_MAIN_APARTMENT,
    CATEGORY_MAIN_HOUSE,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "estates-storage";

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Column order of the persisted dataset.
pub const DATASET_COLUMNS: [&str; 19] = [
    "hash_id",
    "name",
    "price_czk",
    "date_parsed",
    "is_auction",
    "latitude",
    "longitude",
    "category_main_cb",
    "category_sub_cb",
    "house_size_m2",
    "land_size_m2",
    "disposition",
    "comment",
    "new_building",
    "after_reconstruction",
    "furnished",
    "partly_furnished",
    "not_furnished",
    "in_construction",
];

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset header has no `{0}` column")]
    MissingColumn(&'static str),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

/// A data row that could not be decoded; 1-based, header excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRow {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedDataset {
    pub rows: Vec<NormalizedListing>,
    pub skipped: Vec<SkippedRow>,
}

/// Outcome of reading the prior dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadedDataset {
    Missing,
    /// Decodable rows; rows that failed to decode are counted in `skipped_rows`.
    Loaded {
        rows: Vec<NormalizedListing>,
        skipped_rows: usize,
    },
    /// Missing header column or unreadable file.
    Unusable { reason: String },
}

impl LoadedDataset {
    pub fn into_rows(self) -> Vec<NormalizedListing> {
        match self {
            Self::Loaded { rows, .. } => rows,
            Self::Missing | Self::Unusable { .. } => Vec::new(),
        }
    }

    pub fn skipped_rows(&self) -> usize {
        match self {
            Self::Loaded { skipped_rows, .. } => *skipped_rows,
            Self::Missing | Self::Unusable { .. } => 0,
        }
    }
}

/// One CSV row; field names are the persisted column names.
#[derive(Debug, Serialize, Deserialize)]
struct ListingRow {
    hash_id: String,
    name: String,
    #[serde(deserialize_with = "lenient::int")]
    price_czk: i64,
    date_parsed: NaiveDate,
    #[serde(default, deserialize_with = "lenient::flag")]
    is_auction: bool,
    #[serde(default, deserialize_with = "lenient::opt_float")]
    latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_float")]
    longitude: Option<f64>,
    #[serde(deserialize_with = "lenient::int")]
    category_main_cb: i64,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    category_sub_cb: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    house_size_m2: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_u32")]
    land_size_m2: Option<u32>,
    #[serde(default, deserialize_with = "lenient::opt_int")]
    disposition: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_text")]
    comment: Option<String>,
    #[serde(default, deserialize_with = "lenient::flag")]
    new_building: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    after_reconstruction: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    furnished: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    partly_furnished: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    not_furnished: bool,
    #[serde(default, deserialize_with = "lenient::flag")]
    in_construction: bool,
}

impl From<&NormalizedListing> for ListingRow {
    fn from(listing: &NormalizedListing) -> Self {
        let a = listing.amenities;
        Self {
            hash_id: listing.id.clone(),
            name: listing.title.clone(),
            price_czk: listing.price_czk,
            date_parsed: listing.captured_on,
            is_auction: listing.is_auction,
            latitude: listing.latitude,
            longitude: listing.longitude,
            category_main_cb: listing.kind.category_main_cb(),
            category_sub_cb: listing.kind.subclass(),
            house_size_m2: listing.area_m2,
            land_size_m2: listing.kind.land_area_m2(),
            disposition: listing.layout.map(|l| i64::from(l.code())),
            comment: listing.comment.clone(),
            new_building: a.new_building,
            after_reconstruction: a.after_reconstruction,
            furnished: a.furnished,
            partly_furnished: a.partly_furnished,
            not_furnished: a.not_furnished,
            in_construction: a.in_construction,
        }
    }
}

impl TryFrom<ListingRow> for NormalizedListing {
    type Error = String;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        if row.hash_id.trim().is_empty() {
            return Err("empty hash_id".to_string());
        }
        let kind = match row.category_main_cb {
            CATEGORY_MAIN_APARTMENT => PropertyKind::Apartment,
            CATEGORY_MAIN_HOUSE => PropertyKind::House {
                subclass: row.category_sub_cb,
                land_area_m2: row.land_size_m2,
            },
            other => return Err(format!("unsupported category_main_cb {other}")),
        };
        let layout = match row.disposition {
            None => None,
            Some(code) => Some(
                u8::try_from(code)
                    .ok()
                    .and_then(LayoutCode::from_code)
                    .ok_or_else(|| format!("invalid disposition {code}"))?,
            ),
        };
        Ok(Self {
            id: row.hash_id,
            title: row.name,
            price_czk: row.price_czk,
            captured_on: row.date_parsed,
            is_auction: row.is_auction,
            latitude: row.latitude,
            longitude: row.longitude,
            kind,
            area_m2: row.house_size_m2,
            layout,
            comment: row.comment,
            amenities: Amenities {
                new_building: row.new_building,
                after_reconstruction: row.after_reconstruction,
                furnished: row.furnished,
                partly_furnished: row.partly_furnished,
                not_furnished: row.not_furnished,
                in_construction: row.in_construction,
            },
        })
    }
}

/// Cell decoders that also accept files written by pandas (`True`, `120.0`, `NaN`).
mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    fn cell<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    }

    fn parse_int(s: &str) -> Result<i64, String> {
        if let Ok(v) = s.parse::<i64>() {
            return Ok(v);
        }
        let f: f64 = s.parse().map_err(|_| format!("`{s}` is not an integer"))?;
        if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
            Ok(f as i64)
        } else {
            Err(format!("`{s}` is not an integer"))
        }
    }

    pub fn opt_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.filter(|s| !s.is_empty()))
    }

    pub fn opt_int<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        match cell(d)? {
            None => Ok(None),
            Some(s) if s.eq_ignore_ascii_case("nan") => Ok(None),
            Some(s) => parse_int(&s).map(Some).map_err(D::Error::custom),
        }
    }

    pub fn int<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        opt_int(d)?.ok_or_else(|| D::Error::custom("empty cell in required integer column"))
    }

    pub fn opt_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
        opt_int(d)?
            .map(|v| u32::try_from(v).map_err(|_| D::Error::custom(format!("{v} is out of range"))))
            .transpose()
    }

    pub fn opt_float<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match cell(d)? {
            None => Ok(None),
            Some(s) => {
                let v: f64 = s
                    .parse()
                    .map_err(|_| D::Error::custom(format!("`{s}` is not a number")))?;
                Ok((!v.is_nan()).then_some(v))
            }
        }
    }

    pub fn flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match cell(d)?.as_deref() {
            None => Ok(false),
            Some("true" | "True" | "TRUE" | "1" | "1.0") => Ok(true),
            Some("false" | "False" | "FALSE" | "0" | "0.0") => Ok(false),
            Some(other) => Err(D::Error::custom(format!("`{other}` is not a boolean"))),
        }
    }
}

/// Serialize rows to UTF-8 CSV (with BOM) in [`DATASET_COLUMNS`] order.
pub fn encode_csv(rows: &[NormalizedListing]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(UTF8_BOM.to_vec());
    writer
        .write_record(DATASET_COLUMNS)
        .context("writing dataset header")?;
    for listing in rows {
        writer
            .serialize(ListingRow::from(listing))
            .with_context(|| format!("serializing listing {}", listing.id))?;
    }
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("flushing dataset csv: {}", e.error()))
}

/// Decode a dataset file. Only an unreadable header fails the whole file;
/// rows that do not decode are skipped and reported.
pub fn decode_csv(bytes: &[u8]) -> Result<DecodedDataset, DatasetError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    if !reader.headers()?.iter().any(|h| h.trim() == "hash_id") {
        return Err(DatasetError::MissingColumn("hash_id"));
    }

    let mut decoded = DecodedDataset::default();
    for (idx, result) in reader.deserialize::<ListingRow>().enumerate() {
        let row = idx + 1;
        let listing = result
            .map_err(|e| e.to_string())
            .and_then(NormalizedListing::try_from);
        match listing {
            Ok(listing) => decoded.rows.push(listing),
            Err(reason) => {
                warn!(row, %reason, "skipping undecodable dataset row");
                decoded.skipped.push(SkippedRow { row, reason });
            }
        }
    }
    Ok(decoded)
}

async fn write_file_atomically(temp_path: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp dataset file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp dataset file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp dataset file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp dataset file {}", temp_path.display()))?;
    drop(file);
    fs::rename(temp_path, target).await.with_context(|| {
        format!(
            "atomically renaming temp dataset {} -> {}",
            temp_path.display(),
            target.display()
        )
    })
}

/// CSV-backed store for the accumulated listing dataset.
#[derive(Debug, Clone)]
pub struct DatasetStore {
    path: PathBuf,
}

impl DatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the prior dataset. Never fails: unreadable history is reported as `Unusable`.
    pub async fn load(&self) -> LoadedDataset {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return LoadedDataset::Missing,
            Err(err) => {
                return LoadedDataset::Unusable {
                    reason: format!("reading {}: {err}", self.path.display()),
                }
            }
        };
        match decode_csv(&bytes) {
            Ok(decoded) => LoadedDataset::Loaded {
                rows: decoded.rows,
                skipped_rows: decoded.skipped.len(),
            },
            Err(err) => LoadedDataset::Unusable {
                reason: format!("decoding {}: {err}", self.path.display()),
            },
        }
    }

    /// Replace the dataset file using a temp file + atomic rename in the same directory.
    pub async fn save(&self, rows: &[NormalizedListing]) -> anyhow::Result<()> {
        let bytes = encode_csv(rows)?;
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating dataset directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .with_context(|| format!("dataset path {} has no file name", self.path.display()))?
            .to_string_lossy()
            .to_string();
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let write_result = write_file_atomically(&temp_path, &self.path, &bytes).await;
        if write_result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        write_result?;
        debug!(path = %self.path.display(), rows = rows.len(), "dataset saved");
        Ok(())
    }

    /// Move an unusable dataset file aside so a later `save` cannot discard it.
    pub async fn preserve_unusable(&self, at: DateTime<Utc>) -> anyhow::Result<Option<PathBuf>> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking dataset path {}", self.path.display()))?
        {
            return Ok(None);
        }
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset.csv".to_string());
        let aside = self.path.with_file_name(format!(
            "{file_name}.unusable-{}",
            at.format("%Y%m%d_%H%M%S")
        ));
        fs::rename(&self.path, &aside).await.with_context(|| {
            format!(
                "moving unusable dataset {} -> {}",
                self.path.display(),
                aside.display()
            )
        })?;
        Ok(Some(aside))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            default_headers: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// Thin reqwest wrapper: one attempt per request, no retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for header {name}"))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.get_once(url, query).instrument(span).await
    }

    async fn get_once(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(%status, bytes = body.len(), "response received");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    pub async fn fetch_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let response = self.fetch_bytes(url, query).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn flat(id: &str, title: &str) -> NormalizedListing {
        NormalizedListing {
            id: id.to_string(),
            title: title.to_string(),
            price_czk: 5_490_000,
            captured_on: day(),
            is_auction: false,
            latitude: Some(50.0755381),
            longitude: Some(14.4378005),
            kind: PropertyKind::Apartment,
            area_m2: Some(55),
            layout: LayoutCode::from_token("2+kk"),
            comment: None,
            amenities: Amenities {
                furnished: true,
                ..Amenities::default()
            },
        }
    }

    fn house(id: &str) -> NormalizedListing {
        NormalizedListing {
            id: id.to_string(),
            title: "Rodinný dům 120 m², pozemek 800 m² (Žďár nad Sázavou)".to_string(),
            price_czk: 7_900_000,
            captured_on: day(),
            is_auction: true,
            latitude: None,
            longitude: None,
            kind: PropertyKind::House {
                subclass: Some(37),
                land_area_m2: Some(800),
            },
            area_m2: Some(120),
            layout: None,
            comment: Some("Žďár nad Sázavou".to_string()),
            amenities: Amenities {
                new_building: true,
                in_construction: true,
                ..Amenities::default()
            },
        }
    }

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn encoded_csv_starts_with_bom_and_header() {
        let bytes = encode_csv(&[flat("1", "Byt")]).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, DATASET_COLUMNS.join(","));
    }

    #[test]
    fn apartment_row_leaves_house_columns_empty() {
        let bytes = encode_csv(&[flat("1", "Byt")]).unwrap();
        let text = String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).unwrap();
        let row = text.lines().nth(1).unwrap();
        let cells: Vec<&str> = row.split(',').collect();
        assert_eq!(cells[7], "1");
        assert_eq!(cells[8], "");
        assert_eq!(cells[10], "");
        assert_eq!(cells[11], "3");
    }

    #[tokio::test]
    async fn save_then_load_round_trips_rows_and_diacritics() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("reality_houses.csv"));
        let rows = vec![
            flat("2939122764", "Prodej bytu 2+kk, 55 m² (Praha – Vinohrady, \"klidná\" ulice)"),
            house("771234"),
        ];

        store.save(&rows).await.expect("save");
        let loaded = store.load().await;
        assert_eq!(
            loaded,
            LoadedDataset::Loaded {
                rows,
                skipped_rows: 0
            }
        );
    }

    #[tokio::test]
    async fn missing_file_loads_as_missing() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("nope.csv"));
        assert_eq!(store.load().await, LoadedDataset::Missing);
    }

    #[tokio::test]
    async fn file_without_hash_id_column_is_unusable() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "id,name\n1,x\n").unwrap();
        let loaded = DatasetStore::new(&path).load().await;
        match loaded {
            LoadedDataset::Unusable { reason } => assert!(reason.contains("hash_id")),
            other => panic!("expected unusable, got {other:?}"),
        }
    }

    #[test]
    fn decodes_pandas_written_dataset() {
        let text = "\u{feff}hash_id,name,price_czk,date_parsed,is_auction,latitude,longitude,category_main_cb,house_size_m2,land_size_m2,disposition,comment,new_building,after_reconstruction,furnished,partly_furnished,not_furnished,in_construction,category_sub_cb\n\
123,Prodej bytu 3+1 75 m²,4500000,2024-11-02,False,49.19,16.60,1,75.0,,6.0,,False,True,False,False,True,False,\n\
456,Prodej rodinného domu,9900000.0,2024-11-02,True,,,2,140.0,620.0,,po rekonstrukci,False,False,False,False,False,False,37.0\n";
        let decoded = decode_csv(text.as_bytes()).expect("decode");
        assert!(decoded.skipped.is_empty());
        let rows = decoded.rows;
        assert_eq!(rows.len(), 2);

        assert_eq!(rows[0].id, "123");
        assert_eq!(rows[0].kind, PropertyKind::Apartment);
        assert_eq!(rows[0].area_m2, Some(75));
        assert_eq!(rows[0].layout.map(LayoutCode::code), Some(6));
        assert!(rows[0].amenities.after_reconstruction);
        assert!(rows[0].amenities.not_furnished);
        assert_eq!(rows[0].comment, None);

        assert_eq!(rows[1].price_czk, 9_900_000);
        assert!(rows[1].is_auction);
        assert_eq!(rows[1].latitude, None);
        assert_eq!(
            rows[1].kind,
            PropertyKind::House {
                subclass: Some(37),
                land_area_m2: Some(620)
            }
        );
        assert_eq!(rows[1].comment.as_deref(), Some("po rekonstrukci"));
    }

    #[test]
    fn undecodable_rows_are_skipped_and_neighbours_kept() {
        let text = "hash_id,name,price_czk,date_parsed,category_main_cb\n\
111,a,100,2024-01-01,1\n\
333,no price,,2024-01-01,1\n\
222,b,200,2024-01-01,1\n\
444,c,cheap,2024-01-01,1\n";
        let decoded = decode_csv(text.as_bytes()).expect("header is fine");
        assert_eq!(
            decoded.rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["111", "222"]
        );
        assert_eq!(
            decoded.skipped.iter().map(|s| s.row).collect::<Vec<_>>(),
            vec![2, 4]
        );
    }

    #[tokio::test]
    async fn load_counts_skipped_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.csv");
        std::fs::write(
            &path,
            "hash_id,name,price_czk,date_parsed,category_main_cb\n1,a,100,2024-01-01,1\n2,b,,2024-01-01,1\n",
        )
        .unwrap();
        let loaded = DatasetStore::new(&path).load().await;
        assert_eq!(loaded.skipped_rows(), 1);
        assert_eq!(loaded.into_rows().len(), 1);
    }

    #[tokio::test]
    async fn atomic_save_replaces_file_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = DatasetStore::new(dir.path().join("data.csv"));
        store.save(&[flat("1", "first")]).await.expect("first save");
        store
            .save(&[flat("1", "first"), house("2")])
            .await
            .expect("second save");

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["data.csv".to_string()]);
        assert_eq!(store.load().await.into_rows().len(), 2);
    }

    #[tokio::test]
    async fn unusable_dataset_is_moved_aside() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "garbage without the key column\n").unwrap();
        let store = DatasetStore::new(&path);
        let at = DateTime::parse_from_rfc3339("2025-06-01T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let aside = store.preserve_unusable(at).await.unwrap().expect("moved");
        assert!(!path.exists());
        assert!(aside.ends_with("data.csv.unusable-20250601_083000"));
        assert_eq!(
            std::fs::read_to_string(&aside).unwrap(),
            "garbage without the key column\n"
        );
        assert_eq!(store.preserve_unusable(at).await.unwrap(), None);
    }

    #[test]
    fn http_fetcher_rejects_invalid_header_names() {
        let config = HttpClientConfig {
            default_headers: vec![("bad header".to_string(), "x".to_string())],
            ..Default::default()
        };
        assert!(HttpFetcher::new(config).is_err());
    }
}

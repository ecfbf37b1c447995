//! Municipality lookup for point-located listings.
//!
//! [`PolygonIndex`] loads a GeoJSON `FeatureCollection` of municipality polygons
//! and answers point-in-polygon queries; [`enrich_csv`] applies it to a CSV
//! file as a left-outer join.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "estates-geo";

/// Columns appended by [`enrich_csv`].
pub const REGION_COLUMNS: [&str; 3] = ["Obec_nazev", "Obec_kod", "NutsLau"];

const EPSILON: f64 = 1e-12;

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid GeoJSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature {feature}: {message}")]
    InvalidGeometry { feature: usize, message: String },
    #[error("input CSV has no `{0}` column")]
    MissingColumn(&'static str),
}

/// WGS84 position, longitude first as in GeoJSON.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

/// Administrative attributes of the containing municipality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLabel {
    pub name: String,
    pub code: String,
    pub nuts_lau: String,
}

pub trait SpatialJoin {
    fn locate(&self, point: Point) -> Option<RegionLabel>;

    /// Left-outer join: one slot per input point, `None` where nothing contains it.
    fn join(&self, points: &[Point]) -> Vec<Option<RegionLabel>> {
        points.iter().map(|p| self.locate(*p)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BoundingBox {
    min_lon: f64,
    min_lat: f64,
    max_lon: f64,
    max_lat: f64,
}

impl BoundingBox {
    fn empty() -> Self {
        Self {
            min_lon: f64::INFINITY,
            min_lat: f64::INFINITY,
            max_lon: f64::NEG_INFINITY,
            max_lat: f64::NEG_INFINITY,
        }
    }

    fn extend(&mut self, p: Point) {
        self.min_lon = self.min_lon.min(p.lon);
        self.min_lat = self.min_lat.min(p.lat);
        self.max_lon = self.max_lon.max(p.lon);
        self.max_lat = self.max_lat.max(p.lat);
    }

    fn contains(&self, p: Point) -> bool {
        p.lon >= self.min_lon - EPSILON
            && p.lon <= self.max_lon + EPSILON
            && p.lat >= self.min_lat - EPSILON
            && p.lat <= self.max_lat + EPSILON
    }
}

type Ring = Vec<Point>;

/// Outer ring followed by holes.
#[derive(Debug, Clone)]
struct Polygon {
    rings: Vec<Ring>,
}

impl Polygon {
    /// Boundary points (including hole edges) count as contained.
    fn intersects(&self, p: Point) -> bool {
        let Some((outer, holes)) = self.rings.split_first() else {
            return false;
        };
        if self.rings.iter().any(|ring| on_ring_boundary(ring, p)) {
            return true;
        }
        ring_contains(outer, p) && !holes.iter().any(|hole| ring_contains(hole, p))
    }
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    let cross = (b.lon - a.lon) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lon - a.lon);
    if cross.abs() > EPSILON {
        return false;
    }
    p.lon >= a.lon.min(b.lon) - EPSILON
        && p.lon <= a.lon.max(b.lon) + EPSILON
        && p.lat >= a.lat.min(b.lat) - EPSILON
        && p.lat <= a.lat.max(b.lat) + EPSILON
}

fn edges(ring: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = ring.len();
    (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
}

fn on_ring_boundary(ring: &[Point], p: Point) -> bool {
    edges(ring).any(|(a, b)| on_segment(a, b, p))
}

// Even-odd ray casting towards +lon.
fn ring_contains(ring: &[Point], p: Point) -> bool {
    let mut inside = false;
    for (a, b) in edges(ring) {
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let x = a.lon + (p.lat - a.lat) / (b.lat - a.lat) * (b.lon - a.lon);
            if p.lon < x {
                inside = !inside;
            }
        }
    }
    inside
}

#[derive(Debug, Clone)]
struct Region {
    label: RegionLabel,
    bbox: BoundingBox,
    polygons: Vec<Polygon>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
    #[serde(default)]
    properties: Option<Map<String, JsonValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon { coordinates: Vec<Vec<Vec<f64>>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Vec<f64>>>> },
    #[serde(other)]
    Unsupported,
}

fn property_text(props: &Map<String, JsonValue>, key: &str) -> String {
    match props.get(key) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .map(|i| i.to_string())
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| format!("{f:.0}"))
            })
            .unwrap_or_else(|| n.to_string()),
        Some(JsonValue::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn build_polygon(feature: usize, rings: Vec<Vec<Vec<f64>>>) -> Result<Polygon, GeoError> {
    let mut out = Vec::with_capacity(rings.len());
    for ring in rings {
        let mut points = Vec::with_capacity(ring.len());
        for position in ring {
            match position.as_slice() {
                [lon, lat, ..] => points.push(Point::new(*lon, *lat)),
                _ => {
                    return Err(GeoError::InvalidGeometry {
                        feature,
                        message: format!("position with {} coordinates", position.len()),
                    })
                }
            }
        }
        if points.len() < 3 {
            return Err(GeoError::InvalidGeometry {
                feature,
                message: format!("ring with {} positions", points.len()),
            });
        }
        out.push(points);
    }
    Ok(Polygon { rings: out })
}

/// Municipality polygons in file order.
#[derive(Debug, Clone, Default)]
pub struct PolygonIndex {
    regions: Vec<Region>,
}

impl PolygonIndex {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| GeoError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let index = Self::from_geojson_str(&text)?;
        info!(path = %path.display(), regions = index.len(), "polygon index loaded");
        Ok(index)
    }

    pub fn from_geojson_str(text: &str) -> Result<Self, GeoError> {
        let collection: FeatureCollection = serde_json::from_str(text)?;
        let mut regions = Vec::with_capacity(collection.features.len());
        for (idx, feature) in collection.features.into_iter().enumerate() {
            let polygons = match feature.geometry {
                Some(Geometry::Polygon { coordinates }) => vec![build_polygon(idx, coordinates)?],
                Some(Geometry::MultiPolygon { coordinates }) => coordinates
                    .into_iter()
                    .map(|rings| build_polygon(idx, rings))
                    .collect::<Result<Vec<_>, _>>()?,
                Some(Geometry::Unsupported) | None => {
                    debug!(feature = idx, "skipping feature without polygon geometry");
                    continue;
                }
            };
            let props = feature.properties.unwrap_or_default();
            let label = RegionLabel {
                name: property_text(&props, "Nazev"),
                code: property_text(&props, "Kod"),
                nuts_lau: property_text(&props, "NutsLau"),
            };
            let mut bbox = BoundingBox::empty();
            for p in polygons.iter().filter_map(|poly| poly.rings.first()).flatten() {
                bbox.extend(*p);
            }
            regions.push(Region {
                label,
                bbox,
                polygons,
            });
        }
        Ok(Self { regions })
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl SpatialJoin for PolygonIndex {
    fn locate(&self, point: Point) -> Option<RegionLabel> {
        if !point.lon.is_finite() || !point.lat.is_finite() {
            return None;
        }
        self.regions
            .iter()
            .filter(|r| r.bbox.contains(point))
            .find(|r| r.polygons.iter().any(|poly| poly.intersects(point)))
            .map(|r| r.label.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnrichSummary {
    pub rows: usize,
    pub matched: usize,
    pub without_coordinates: usize,
}

fn parse_coordinate(cell: Option<&str>) -> Option<f64> {
    cell.and_then(|c| c.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Copy `input` to `output`, appending [`REGION_COLUMNS`] to every row.
///
/// Rows without usable coordinates or outside every polygon keep empty region cells.
pub fn enrich_csv(
    input: &Path,
    index: &dyn SpatialJoin,
    output: &Path,
) -> anyhow::Result<EnrichSummary> {
    let bytes = fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);

    let headers = reader
        .headers()
        .with_context(|| format!("reading header of {}", input.display()))?
        .clone();
    let column = |name: &'static str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or(GeoError::MissingColumn(name))
    };
    let lat_idx = column("latitude")?;
    let lon_idx = column("longitude")?;

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("creating {}", output.display()))?;
    let mut out_headers = headers.clone();
    for name in REGION_COLUMNS {
        out_headers.push_field(name);
    }
    writer.write_record(&out_headers)?;

    let mut summary = EnrichSummary::default();
    for (row, record) in reader.records().enumerate() {
        let mut record =
            record.with_context(|| format!("reading row {} of {}", row + 1, input.display()))?;
        summary.rows += 1;
        let lat = parse_coordinate(record.get(lat_idx));
        let lon = parse_coordinate(record.get(lon_idx));
        let label = match (lon, lat) {
            (Some(lon), Some(lat)) => index.locate(Point::new(lon, lat)),
            _ => {
                summary.without_coordinates += 1;
                None
            }
        };
        match label {
            Some(label) => {
                summary.matched += 1;
                record.push_field(&label.name);
                record.push_field(&label.code);
                record.push_field(&label.nuts_lau);
            }
            None => {
                for _ in REGION_COLUMNS {
                    record.push_field("");
                }
            }
        }
        writer.write_record(&record)?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;

    info!(
        input = %input.display(),
        output = %output.display(),
        rows = summary.rows,
        matched = summary.matched,
        without_coordinates = summary.without_coordinates,
        "csv enriched with municipality labels"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // Two unit squares side by side; the first has a hole, the second is a MultiPolygon.
    const MUNICIPALITIES: &str = r#"{
      "type": "FeatureCollection",
      "features": [
        {
          "type": "Feature",
          "properties": { "Nazev": "Praha", "Kod": 554782, "NutsLau": "CZ0100" },
          "geometry": {
            "type": "Polygon",
            "coordinates": [
              [[14.0, 50.0], [15.0, 50.0], [15.0, 51.0], [14.0, 51.0], [14.0, 50.0]],
              [[14.4, 50.4], [14.6, 50.4], [14.6, 50.6], [14.4, 50.6], [14.4, 50.4]]
            ]
          }
        },
        {
          "type": "Feature",
          "properties": { "Nazev": "Černošice", "Kod": "539139", "NutsLau": "CZ020A" },
          "geometry": {
            "type": "MultiPolygon",
            "coordinates": [
              [[[15.0, 50.0], [16.0, 50.0], [16.0, 51.0], [15.0, 51.0], [15.0, 50.0]]],
              [[[20.0, 45.0], [21.0, 45.0], [21.0, 46.0], [20.0, 45.0]]]
            ]
          }
        },
        { "type": "Feature", "properties": { "Nazev": "Bod" }, "geometry": { "type": "Point", "coordinates": [14.5, 50.5] } }
      ]
    }"#;

    fn index() -> PolygonIndex {
        PolygonIndex::from_geojson_str(MUNICIPALITIES).expect("valid geojson")
    }

    fn name(point: Point) -> Option<String> {
        index().locate(point).map(|l| l.name)
    }

    #[test]
    fn loads_polygon_features_and_skips_others() {
        let idx = index();
        assert_eq!(idx.len(), 2);
        let praha = idx.locate(Point::new(14.2, 50.2)).unwrap();
        assert_eq!(
            praha,
            RegionLabel {
                name: "Praha".into(),
                code: "554782".into(),
                nuts_lau: "CZ0100".into(),
            }
        );
    }

    #[test]
    fn holes_are_excluded_but_their_edges_are_not() {
        assert_eq!(name(Point::new(14.5, 50.5)), None);
        assert_eq!(name(Point::new(14.4, 50.5)).as_deref(), Some("Praha"));
    }

    #[test]
    fn shared_boundary_goes_to_first_feature() {
        assert_eq!(name(Point::new(15.0, 50.5)).as_deref(), Some("Praha"));
        assert_eq!(name(Point::new(15.5, 50.5)).as_deref(), Some("Černošice"));
    }

    #[test]
    fn multipolygon_parts_are_all_searched() {
        assert_eq!(name(Point::new(20.2, 45.1)).as_deref(), Some("Černošice"));
        assert_eq!(name(Point::new(20.1, 45.9)), None);
    }

    #[test]
    fn join_is_left_outer() {
        let labels = index().join(&[
            Point::new(14.2, 50.2),
            Point::new(0.0, 0.0),
            Point::new(f64::NAN, 50.0),
        ]);
        assert_eq!(labels.len(), 3);
        assert!(labels[0].is_some());
        assert!(labels[1].is_none());
        assert!(labels[2].is_none());
    }

    #[test]
    fn degenerate_ring_is_rejected() {
        let err = PolygonIndex::from_geojson_str(
            r#"{"type":"FeatureCollection","features":[{"type":"Feature","properties":{},"geometry":{"type":"Polygon","coordinates":[[[0,0],[1,1]]]}}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, GeoError::InvalidGeometry { feature: 0, .. }));
    }

    #[test]
    fn missing_polygon_file_is_an_io_error() {
        let err = PolygonIndex::load("/nonexistent/obce.geojson").unwrap_err();
        assert!(matches!(err, GeoError::Io { .. }));
    }

    #[test]
    fn enrich_appends_region_columns_to_every_row() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("reality_houses.csv");
        let output = dir.path().join("input_with_ruian.csv");
        std::fs::write(
            &input,
            "\u{feff}hash_id,name,latitude,longitude\n\
             1,\"Byt, centrum\",50.2,14.2\n\
             2,Dům,50.5,15.5\n\
             3,Chata,,\n\
             4,Moře,10.0,10.0\n",
        )
        .unwrap();

        let summary = enrich_csv(&input, &index(), &output).expect("enrich");
        assert_eq!(
            summary,
            EnrichSummary {
                rows: 4,
                matched: 2,
                without_coordinates: 1,
            }
        );

        let written = std::fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "hash_id,name,latitude,longitude,Obec_nazev,Obec_kod,NutsLau");
        assert_eq!(lines[1], "1,\"Byt, centrum\",50.2,14.2,Praha,554782,CZ0100");
        assert_eq!(lines[2], "2,Dům,50.5,15.5,Černošice,539139,CZ020A");
        assert_eq!(lines[3], "3,Chata,,,,,");
        assert_eq!(lines[4], "4,Moře,10.0,10.0,,,");
    }

    #[test]
    fn enrich_requires_coordinate_columns() {
        let dir = tempdir().expect("tempdir");
        let input = dir.path().join("in.csv");
        std::fs::write(&input, "hash_id,lat,lon\n1,50,14\n").unwrap();
        let err = enrich_csv(&input, &index(), &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GeoError>(),
            Some(GeoError::MissingColumn("latitude"))
        ));
    }
}

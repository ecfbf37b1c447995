//! Core domain model for listing ingestion.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "estates-core";

/// `seo.category_type_cb` value marking a listing for sale (as opposed to rent or auction-only).
pub const CATEGORY_TYPE_SALE: i64 = 1;
pub const CATEGORY_MAIN_APARTMENT: i64 = 1;
pub const CATEGORY_MAIN_HOUSE: i64 = 2;

/// Source convention for "price on request"; such listings are never admitted.
pub const SENTINEL_PRICE: i64 = 1;

/// Property class of an accepted listing.
///
/// Sub-category and land area only exist for houses; apartments carry neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum PropertyKind {
    Apartment,
    House {
        subclass: Option<i64>,
        land_area_m2: Option<u32>,
    },
}

impl PropertyKind {
    pub fn category_main_cb(&self) -> i64 {
        match self {
            Self::Apartment => CATEGORY_MAIN_APARTMENT,
            Self::House { .. } => CATEGORY_MAIN_HOUSE,
        }
    }

    pub fn subclass(&self) -> Option<i64> {
        match self {
            Self::Apartment => None,
            Self::House { subclass, .. } => *subclass,
        }
    }

    pub fn land_area_m2(&self) -> Option<u32> {
        match self {
            Self::Apartment => None,
            Self::House { land_area_m2, .. } => *land_area_m2,
        }
    }

    pub fn is_house(&self) -> bool {
        matches!(self, Self::House { .. })
    }
}

const LAYOUT_TABLE: [(&str, u8); 10] = [
    ("1+kk", 1),
    ("1+1", 2),
    ("2+kk", 3),
    ("2+1", 4),
    ("3+kk", 5),
    ("3+1", 6),
    ("4+kk", 7),
    ("4+1", 8),
    ("5+kk", 9),
    ("5+1", 10),
];

/// Integer encoding of a room-layout token such as `2+kk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct LayoutCode(u8);

impl LayoutCode {
    pub fn from_token(token: &str) -> Option<Self> {
        LAYOUT_TABLE
            .iter()
            .find(|(t, _)| *t == token)
            .map(|(_, code)| Self(*code))
    }

    pub fn from_code(code: u8) -> Option<Self> {
        LAYOUT_TABLE
            .iter()
            .any(|(_, c)| *c == code)
            .then_some(Self(code))
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn token(self) -> &'static str {
        LAYOUT_TABLE
            .iter()
            .find(|(_, c)| *c == self.0)
            .map(|(t, _)| *t)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidLayoutCode(pub u8);

impl fmt::Display for InvalidLayoutCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layout code {} is outside 1..=10", self.0)
    }
}

impl std::error::Error for InvalidLayoutCode {}

impl TryFrom<u8> for LayoutCode {
    type Error = InvalidLayoutCode;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_code(value).ok_or(InvalidLayoutCode(value))
    }
}

impl From<LayoutCode> for u8 {
    fn from(value: LayoutCode) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Amenity {
    NewBuilding,
    AfterReconstruction,
    Furnished,
    PartlyFurnished,
    NotFurnished,
    InConstruction,
}

impl Amenity {
    pub const ALL: [Amenity; 6] = [
        Amenity::NewBuilding,
        Amenity::AfterReconstruction,
        Amenity::Furnished,
        Amenity::PartlyFurnished,
        Amenity::NotFurnished,
        Amenity::InConstruction,
    ];

    /// Label string as it appears in the source's `labelsAll` collection.
    pub fn label(self) -> &'static str {
        match self {
            Amenity::NewBuilding => "new_building",
            Amenity::AfterReconstruction => "after_reconstruction",
            Amenity::Furnished => "furnished",
            Amenity::PartlyFurnished => "partly_furnished",
            Amenity::NotFurnished => "not_furnished",
            Amenity::InConstruction => "in_construction",
        }
    }
}

/// Boolean amenity flags derived from a listing's label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Amenities {
    pub new_building: bool,
    pub after_reconstruction: bool,
    pub furnished: bool,
    pub partly_furnished: bool,
    pub not_furnished: bool,
    pub in_construction: bool,
}

impl Amenities {
    /// Exact label matches only; unknown labels are ignored.
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a str>) -> Self {
        let mut out = Self::default();
        for label in labels {
            if let Some(amenity) = Amenity::ALL.into_iter().find(|a| a.label() == label) {
                out.set(amenity, true);
            }
        }
        out
    }

    pub fn get(&self, amenity: Amenity) -> bool {
        match amenity {
            Amenity::NewBuilding => self.new_building,
            Amenity::AfterReconstruction => self.after_reconstruction,
            Amenity::Furnished => self.furnished,
            Amenity::PartlyFurnished => self.partly_furnished,
            Amenity::NotFurnished => self.not_furnished,
            Amenity::InConstruction => self.in_construction,
        }
    }

    pub fn set(&mut self, amenity: Amenity, value: bool) {
        let slot = match amenity {
            Amenity::NewBuilding => &mut self.new_building,
            Amenity::AfterReconstruction => &mut self.after_reconstruction,
            Amenity::Furnished => &mut self.furnished,
            Amenity::PartlyFurnished => &mut self.partly_furnished,
            Amenity::NotFurnished => &mut self.not_furnished,
            Amenity::InConstruction => &mut self.in_construction,
        };
        *slot = value;
    }
}

/// Canonical listing record produced by the parser and persisted in the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    /// Stable external identifier (`hash_id`); the dedup key.
    pub id: String,
    pub title: String,
    pub price_czk: i64,
    /// Day the listing was fetched, not the listing's own date.
    pub captured_on: NaiveDate,
    pub is_auction: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub kind: PropertyKind,
    pub area_m2: Option<u32>,
    pub layout: Option<LayoutCode>,
    pub comment: Option<String>,
    pub amenities: Amenities,
}

impl NormalizedListing {
    pub fn land_area_m2(&self) -> Option<u32> {
        self.kind.land_area_m2()
    }

    pub fn subclass(&self) -> Option<i64> {
        self.kind.subclass()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_table_covers_one_through_ten() {
        assert_eq!(LayoutCode::from_token("1+kk").map(LayoutCode::code), Some(1));
        assert_eq!(LayoutCode::from_token("2+kk").map(LayoutCode::code), Some(3));
        assert_eq!(LayoutCode::from_token("3+1").map(LayoutCode::code), Some(6));
        assert_eq!(LayoutCode::from_token("5+1").map(LayoutCode::code), Some(10));
        assert_eq!(LayoutCode::from_token("6+kk"), None);
        assert_eq!(LayoutCode::from_token("2+KK"), None);
        for code in 1..=10u8 {
            let layout = LayoutCode::from_code(code).unwrap();
            assert_eq!(LayoutCode::from_token(layout.token()), Some(layout));
        }
        assert_eq!(LayoutCode::from_code(0), None);
        assert_eq!(LayoutCode::from_code(11), None);
    }

    #[test]
    fn layout_code_rejects_out_of_range_on_deserialize() {
        let ok: LayoutCode = serde_json::from_str("4").unwrap();
        assert_eq!(ok.code(), 4);
        assert!(serde_json::from_str::<LayoutCode>("42").is_err());
    }

    #[test]
    fn amenities_match_exact_labels_only() {
        let amenities = Amenities::from_labels(["furnished", "balcony", "in_construction", "Furnished"]);
        assert!(amenities.furnished);
        assert!(amenities.in_construction);
        assert!(!amenities.partly_furnished);
        assert!(!amenities.new_building);

        let none = Amenities::from_labels(std::iter::empty());
        assert_eq!(none, Amenities::default());
    }

    #[test]
    fn apartment_has_no_subclass_or_land() {
        let flat = PropertyKind::Apartment;
        assert_eq!(flat.category_main_cb(), 1);
        assert_eq!(flat.subclass(), None);
        assert_eq!(flat.land_area_m2(), None);

        let house = PropertyKind::House {
            subclass: Some(37),
            land_area_m2: Some(800),
        };
        assert_eq!(house.category_main_cb(), 2);
        assert_eq!(house.subclass(), Some(37));
        assert_eq!(house.land_area_m2(), Some(800));
        assert!(house.is_house());
    }

    #[test]
    fn apartment_serializes_without_house_fields() {
        let json = serde_json::to_value(PropertyKind::Apartment).unwrap();
        assert_eq!(json, serde_json::json!({ "class": "apartment" }));
    }
}

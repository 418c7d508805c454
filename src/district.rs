//! Справочник районов города: категория застройки, центроиды по умолчанию и seed.

use serde::Serialize;

const URBAN_DISTRICTS: [&str; 4] = [
    "Semarang Tengah",
    "Semarang Utara",
    "Candisari",
    "Semarang Timur",
];
const SUBURBAN_DISTRICTS: [&str; 4] = ["Tembalang", "Banyumanik", "Gunungpati", "Mijen"];

/// Центроиды районов (широта, долгота) на случай, когда геометрия недоступна.
const DEFAULT_CENTROIDS: [(&str, f64, f64); 16] = [
    ("Semarang Tengah", -7.0051, 110.4381),
    ("Semarang Utara", -6.9667, 110.4167),
    ("Semarang Selatan", -7.0333, 110.4500),
    ("Semarang Barat", -6.9833, 110.3833),
    ("Semarang Timur", -7.0167, 110.4667),
    ("Candisari", -7.0500, 110.4000),
    ("Gayamsari", -6.9500, 110.4000),
    ("Pedurungan", -7.0667, 110.3833),
    ("Genuk", -7.0833, 110.4167),
    ("Tembalang", -7.1000, 110.3500),
    ("Gunungpati", -7.0000, 110.3500),
    ("Mijen", -6.9333, 110.3500),
    ("Ngaliyan", -7.0667, 110.3167),
    ("Banyumanik", -7.0833, 110.4333),
    ("Tugu", -6.8667, 110.3167),
    ("Gajahmungkur", -7.0500, 110.4500),
];

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SEED_MODULUS: u64 = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistrictCategory {
    Urban,
    Suburban,
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistrictProfile {
    pub name: String,
    pub category: DistrictCategory,
}

impl DistrictProfile {
    pub fn lookup(name: &str) -> Self {
        let category = if URBAN_DISTRICTS.contains(&name) {
            DistrictCategory::Urban
        } else if SUBURBAN_DISTRICTS.contains(&name) {
            DistrictCategory::Suburban
        } else {
            DistrictCategory::Other
        };
        Self {
            name: name.to_string(),
            category,
        }
    }

    pub fn seed(&self) -> u64 {
        entity_seed(&self.name)
    }
}

/// Стабильный seed по имени: FNV-1a (64 бита) по UTF-8 байтам, по модулю 1000.
pub fn entity_seed(name: &str) -> u64 {
    let hash = name.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    hash % SEED_MODULUS
}

pub fn default_centroid(name: &str) -> Option<(f64, f64)> {
    DEFAULT_CENTROIDS
        .iter()
        .find(|(district, _, _)| *district == name)
        .map(|&(_, lat, lon)| (lat, lon))
}

pub fn known_districts() -> impl Iterator<Item = &'static str> {
    DEFAULT_CENTROIDS.iter().map(|(name, _, _)| *name)
}

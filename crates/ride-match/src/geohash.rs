//! Geohash cell indexer.
//!
//! Bits alternate between longitude and latitude, starting with longitude,
//! and every five bits select one symbol of the geohash base-32 alphabet.
//! Nearby points usually share a prefix, so a fixed-length hash is used as
//! the `g` tag that scopes subscriptions to a local area.

use serde::{Deserialize, Serialize};

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Default cell length, roughly 1.2 km x 0.6 km.
pub const DEFAULT_PRECISION: usize = 6;

/// Longest hash that still adds resolution to an `f64` coordinate.
pub const MAX_PRECISION: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn center(&self) -> Coordinates {
        Coordinates {
            latitude: (self.min_lat + self.max_lat) / 2.0,
            longitude: (self.min_lon + self.max_lon) / 2.0,
        }
    }

    /// Inclusive on every edge.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&latitude)
            && (self.min_lon..=self.max_lon).contains(&longitude)
    }
}

/// Encode a coordinate into a geohash of `precision` characters.
///
/// Callers must pass finite coordinates in range; NaN yields an arbitrary
/// (but still deterministic) hash.
pub fn encode(latitude: f64, longitude: f64, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut even_bit = true;
    let mut bit = 0;
    let mut index = 0usize;

    while hash.len() < precision {
        let (range, value) = if even_bit {
            (&mut lon_range, longitude)
        } else {
            (&mut lat_range, latitude)
        };
        let mid = (range.0 + range.1) / 2.0;
        if value >= mid {
            index = (index << 1) | 1;
            range.0 = mid;
        } else {
            index <<= 1;
            range.1 = mid;
        }
        even_bit = !even_bit;

        bit += 1;
        if bit == 5 {
            hash.push(char::from(BASE32[index]));
            bit = 0;
            index = 0;
        }
    }

    hash
}

/// Encode with [`DEFAULT_PRECISION`].
pub fn encode_default(latitude: f64, longitude: f64) -> String {
    encode(latitude, longitude, DEFAULT_PRECISION)
}

/// Bounding box of the cell named by `hash`.
///
/// Characters outside the alphabet are skipped. Decoding is case-insensitive.
pub fn decode_bounds(hash: &str) -> BoundingBox {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut even_bit = true;

    for symbol in hash.bytes().map(|byte| byte.to_ascii_lowercase()) {
        let Some(value) = BASE32.iter().position(|candidate| *candidate == symbol) else {
            continue;
        };
        for shift in (0..5).rev() {
            let bit_set = (value >> shift) & 1 == 1;
            let range = if even_bit {
                &mut lon_range
            } else {
                &mut lat_range
            };
            let mid = (range.0 + range.1) / 2.0;
            if bit_set {
                range.0 = mid;
            } else {
                range.1 = mid;
            }
            even_bit = !even_bit;
        }
    }

    BoundingBox {
        min_lat: lat_range.0,
        max_lat: lat_range.1,
        min_lon: lon_range.0,
        max_lon: lon_range.1,
    }
}

/// Whether `hash` is a non-empty, lowercase geohash of at most
/// [`MAX_PRECISION`] symbols.
pub fn is_valid(hash: &str) -> bool {
    !hash.is_empty() && hash.len() <= MAX_PRECISION && hash.bytes().all(|byte| BASE32.contains(&byte))
}

/// Center point of the cell named by `hash`.
pub fn decode(hash: &str) -> Coordinates {
    decode_bounds(hash).center()
}

//! Session identity derivation.
//!
//! A session identity is the single key a generation request is known by:
//! the queue deduplicates on it, the tracker reports on it, the result cache
//! stores under it, and the working directory is named after it.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumString};

/// Fixed-point scale used to project coordinates (1e-5 degrees, ~1.1 m).
const COORDINATE_SCALE: f64 = 100_000.0;

/// Number of fractional digits kept after projection.
const FRACTION_DIGITS: usize = 5;

/// Supported game codes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum GameCode {
    Fs22,
    Fs25,
}

impl GameCode {
    /// Upper-cased code used in history entries.
    pub fn label(&self) -> String {
        self.as_ref().to_ascii_uppercase()
    }
}

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Coordinates truncated to whole degrees, for history and logs.
    pub fn rounded(&self) -> (i32, i32) {
        (self.lat as i32, self.lon as i32)
    }
}

/// Deterministic identity of a generation session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an identity received from a caller (e.g. a retrieval request).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive the session identity for a request.
///
/// Coordinates are projected onto a 1e-5 degree grid, so requests that
/// differ only by float noise share an identity while neighbouring but
/// distinct locations do not. Non-finite values project to zero.
pub fn derive(coordinates: Coordinates, game: GameCode) -> SessionId {
    let lat = format_axis(coordinates.lat, 'N', 'S');
    let lon = format_axis(coordinates.lon, 'E', 'W');
    SessionId(format!("{}_{}_{}", game, lat, lon))
}

fn project(value: f64) -> i64 {
    // `as` saturates and maps NaN to 0.
    (value * COORDINATE_SCALE).round() as i64
}

fn format_axis(value: f64, positive: char, negative: char) -> String {
    let fixed = project(value);
    let hemisphere = if fixed < 0 { negative } else { positive };
    let abs = fixed.unsigned_abs();
    let scale = COORDINATE_SCALE as u64;
    format!(
        "{}{}.{:0width$}",
        hemisphere,
        abs / scale,
        abs % scale,
        width = FRACTION_DIGITS
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::str::FromStr;

    #[test]
    fn test_derive_is_deterministic() {
        let coords = Coordinates::new(45.285541402763336, 20.237452197282817);
        let first = derive(coords, GameCode::Fs25);
        for _ in 0..10 {
            assert_eq!(derive(coords, GameCode::Fs25), first);
        }
        assert_eq!(first.as_str(), "fs25_N45.28554_E20.23745");
    }

    #[rstest]
    #[case(-33.8688, 151.2093, "fs22_S33.86880_E151.20930")]
    #[case(40.7128, -74.006, "fs22_N40.71280_W74.00600")]
    #[case(-0.000001, -0.000001, "fs22_N0.00000_E0.00000")]
    #[case(0.00001, -0.00001, "fs22_N0.00001_W0.00001")]
    fn test_derive_hemispheres(#[case] lat: f64, #[case] lon: f64, #[case] expected: &str) {
        assert_eq!(
            derive(Coordinates::new(lat, lon), GameCode::Fs22).as_str(),
            expected
        );
    }

    #[test]
    fn test_float_noise_collapses() {
        let a = derive(Coordinates::new(45.2855, 20.2375), GameCode::Fs25);
        let b = derive(Coordinates::new(45.2855000001, 20.2374999999), GameCode::Fs25);
        assert_eq!(a, b);
    }

    #[test]
    fn test_adjacent_locations_stay_distinct() {
        let a = derive(Coordinates::new(45.28554, 20.23745), GameCode::Fs25);
        let b = derive(Coordinates::new(45.28555, 20.23745), GameCode::Fs25);
        assert_ne!(a, b);
    }

    #[test]
    fn test_game_code_is_part_of_identity() {
        let coords = Coordinates::new(45.0, 20.0);
        assert_ne!(derive(coords, GameCode::Fs22), derive(coords, GameCode::Fs25));
    }

    #[test]
    fn test_non_finite_coordinates_still_produce_identity() {
        let id = derive(Coordinates::new(f64::NAN, f64::INFINITY), GameCode::Fs25);
        assert!(id.as_str().starts_with("fs25_N0.00000_E"));
    }

    #[test]
    fn test_game_code_parsing() {
        assert_eq!(GameCode::from_str("FS25").unwrap(), GameCode::Fs25);
        assert_eq!(GameCode::Fs22.to_string(), "fs22");
        assert_eq!(GameCode::Fs25.label(), "FS25");
        assert!(GameCode::from_str("fs19").is_err());
    }

    #[test]
    fn test_rounded_coordinates() {
        assert_eq!(Coordinates::new(45.9, -20.7).rounded(), (45, -20));
    }
}

//! Static per-country reference data: map viewports and emergency
//! numbers. Pure lookups, no state; misses are handled by the
//! resolver's fallback chain, never by an error here.

use crate::model::LatLon;

/// A map viewport: center plus the latitude/longitude span shown.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MapRegion {
    pub center: LatLon,
    pub lat_span: f64,
    pub lon_span: f64,
}

impl MapRegion {
    #[must_use]
    pub const fn new(lat: f64, lon: f64, lat_span: f64, lon_span: f64) -> Self {
        Self {
            center: LatLon { lat, lon },
            lat_span,
            lon_span,
        }
    }
}

/// Continent-scale fallback when nothing better is known.
pub const DEFAULT_REGION: MapRegion = MapRegion::new(-25.2744, 133.7751, 40.0, 50.0);

/// Span used when centering on a raw fix without country data.
pub const TIGHT_SPAN_DEG: f64 = 0.1;

/// Countries the dataset carries. Keyed by display name, the same
/// string reverse geocoding reports.
pub const COUNTRIES: [&str; 7] = [
    "Australia",
    "Qatar",
    "Austria",
    "Switzerland",
    "United Kingdom",
    "United States",
    "Canada",
];

#[must_use]
pub fn viewport(country: &str) -> Option<MapRegion> {
    let region = match country {
        "Australia" => MapRegion::new(-33.8937, 151.1966, 0.3, 0.3),
        "Qatar" => MapRegion::new(25.3548, 51.1839, 1.5, 1.5),
        "Austria" => MapRegion::new(47.2162, 13.3501, 9.0, 9.0),
        "Switzerland" => MapRegion::new(46.9487, 9.2654, 2.5, 2.5),
        "United Kingdom" => MapRegion::new(51.5113, -0.1105, 0.4, 0.4),
        "United States" => MapRegion::new(37.8283, -98.5795, 60.0, 60.0),
        "Canada" => MapRegion::new(49.6, -123.0, 1.1, 1.1),
        _ => return None,
    };
    Some(region)
}

#[must_use]
pub fn emergency_number(country: &str) -> Option<&'static str> {
    let number = match country {
        "Australia" => "000",
        "Qatar" | "United Kingdom" => "999",
        "Austria" | "Switzerland" => "112",
        "United States" | "Canada" => "911",
        _ => return None,
    };
    Some(number)
}

/// Full table, for the pick-a-number menu when the current country is
/// unknown or the override flag is set.
#[must_use]
pub fn emergency_numbers() -> Vec<(&'static str, &'static str)> {
    COUNTRIES
        .iter()
        .filter_map(|&country| emergency_number(country).map(|number| (country, number)))
        .collect()
}

//! Regional Diversity
//!
//! Peers are mapped to one of six fixed continental bounding boxes by a
//! point-in-box lookup on their announced location. Candidate selection
//! caps each region at two slots per circuit; peers without a location
//! (or outside every box) fall into `Unknown`.

use veil_signal::WireLocation;

/// Coarse geographic region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    NorthAmerica,
    SouthAmerica,
    Europe,
    Africa,
    Asia,
    Oceania,
    Unknown,
}

struct BoundingBox {
    lat_min: f64,
    lat_max: f64,
    lon_min: f64,
    lon_max: f64,
}

impl BoundingBox {
    fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_min && lat <= self.lat_max && lon >= self.lon_min && lon <= self.lon_max
    }
}

// Checked in order; the first hit wins. The boxes are coarse on
// purpose: they only keep a circuit from clustering on one continent.
const BOXES: [(Region, BoundingBox); 6] = [
    (
        Region::NorthAmerica,
        BoundingBox { lat_min: 7.0, lat_max: 84.0, lon_min: -169.0, lon_max: -52.0 },
    ),
    (
        Region::SouthAmerica,
        BoundingBox { lat_min: -56.0, lat_max: 13.0, lon_min: -82.0, lon_max: -34.0 },
    ),
    (
        Region::Europe,
        BoundingBox { lat_min: 36.0, lat_max: 71.0, lon_min: -25.0, lon_max: 45.0 },
    ),
    (
        Region::Africa,
        BoundingBox { lat_min: -35.0, lat_max: 37.0, lon_min: -18.0, lon_max: 52.0 },
    ),
    (
        Region::Asia,
        BoundingBox { lat_min: -10.0, lat_max: 78.0, lon_min: 45.0, lon_max: 180.0 },
    ),
    (
        Region::Oceania,
        BoundingBox { lat_min: -48.0, lat_max: 0.0, lon_min: 110.0, lon_max: 180.0 },
    ),
];

impl Region {
    /// Locate a point; `Unknown` when no box matches
    pub fn locate(location: Option<&WireLocation>) -> Region {
        let Some(loc) = location else {
            return Region::Unknown;
        };
        for (region, bbox) in BOXES.iter() {
            if bbox.contains(loc.latitude, loc.longitude) {
                return *region;
            }
        }
        Region::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(lat: f64, lon: f64) -> WireLocation {
        WireLocation { latitude: lat, longitude: lon, accuracy: 100.0 }
    }

    #[test]
    fn test_known_cities() {
        assert_eq!(Region::locate(Some(&at(40.7, -74.0))), Region::NorthAmerica); // New York
        assert_eq!(Region::locate(Some(&at(-23.5, -46.6))), Region::SouthAmerica); // Sao Paulo
        assert_eq!(Region::locate(Some(&at(52.5, 13.4))), Region::Europe); // Berlin
        assert_eq!(Region::locate(Some(&at(6.5, 3.4))), Region::Africa); // Lagos
        assert_eq!(Region::locate(Some(&at(35.7, 139.7))), Region::Asia); // Tokyo
        assert_eq!(Region::locate(Some(&at(-33.8, 151.2))), Region::Oceania); // Sydney
    }

    #[test]
    fn test_unmatched_point_is_unknown() {
        // Mid-Pacific
        assert_eq!(Region::locate(Some(&at(0.0, -150.0))), Region::Unknown);
    }

    #[test]
    fn test_missing_location_is_unknown() {
        assert_eq!(Region::locate(None), Region::Unknown);
    }
}

//! Polygon containment for search regions and export filters.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::GeoPoint;

/// A closed polygon given as `[lng, lat]` pairs in degrees.
///
/// The ring does not need to repeat its first vertex. Containment uses the
/// even-odd rule, so points exactly on an edge may fall either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>", into = "Vec<[f64; 2]>")]
pub struct Polygon {
    ring: Vec<[f64; 2]>,
}

impl Polygon {
    /// Creates a polygon, rejecting rings with fewer than three distinct vertices.
    pub fn new(ring: Vec<[f64; 2]>) -> Result<Self, AppError> {
        let mut ring = ring;
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < 3 {
            return Err(AppError::ConfigError(format!(
                "polygon needs at least 3 vertices, got {}",
                ring.len()
            )));
        }
        Ok(Self { ring })
    }

    pub fn vertices(&self) -> &[[f64; 2]] {
        &self.ring
    }

    /// Returns true if the point lies inside the polygon.
    pub fn contains(&self, point: GeoPoint) -> bool {
        let (x, y) = (point.lng(), point.lat());
        let mut inside = false;
        let mut j = self.ring.len() - 1;
        for i in 0..self.ring.len() {
            let [xi, yi] = self.ring[i];
            let [xj, yj] = self.ring[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

impl TryFrom<Vec<[f64; 2]>> for Polygon {
    type Error = AppError;

    fn try_from(ring: Vec<[f64; 2]>) -> Result<Self, Self::Error> {
        Self::new(ring)
    }
}

impl From<Polygon> for Vec<[f64; 2]> {
    fn from(polygon: Polygon) -> Self {
        polygon.ring
    }
}

//! Domain models for portal observations and canonical portal records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::identity::compute_content_key;

/// Scale factor between degrees and the stored integer micro-degrees.
pub const MICRODEGREES: f64 = 1_000_000.0;

const MAX_LAT_E6: i32 = 90_000_000;
const MAX_LNG_E6: i32 = 180_000_000;

/// A point on the map in integer micro-degrees.
///
/// Coordinates are compared exactly; two observations at the same
/// `(lat_e6, lng_e6)` pair are considered to be at the same location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat_e6: i32,
    pub lng_e6: i32,
}

impl GeoPoint {
    pub fn new(lat_e6: i32, lng_e6: i32) -> Self {
        Self { lat_e6, lng_e6 }
    }

    /// Builds a point from floating point degrees, rounding to the nearest micro-degree.
    pub fn from_degrees(lat: f64, lng: f64) -> Self {
        Self {
            lat_e6: (lat * MICRODEGREES).round() as i32,
            lng_e6: (lng * MICRODEGREES).round() as i32,
        }
    }

    pub fn lat(&self) -> f64 {
        self.lat_e6 as f64 / MICRODEGREES
    }

    pub fn lng(&self) -> f64 {
        self.lng_e6 as f64 / MICRODEGREES
    }

    /// Returns true if the point lies within the valid latitude/longitude range.
    pub fn is_valid(&self) -> bool {
        self.lat_e6.abs() <= MAX_LAT_E6 && self.lng_e6.abs() <= MAX_LNG_E6
    }

    /// Link to the Intel map centered on this point.
    pub fn intel_url(&self) -> String {
        format!(
            "https://www.ingress.com/intel?ll={:.6},{:.6}&z=17",
            self.lat(),
            self.lng()
        )
    }
}

impl std::fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6},{:.6}", self.lat(), self.lng())
    }
}

/// Identity under which an observation is matched against stored records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortalIdentity {
    Guid(String),
    Location(GeoPoint),
}

impl PortalIdentity {
    /// Key used to serialize concurrent merges touching the same identity.
    pub fn lock_key(&self) -> String {
        match self {
            PortalIdentity::Guid(guid) => format!("portal:guid:{}", guid),
            PortalIdentity::Location(point) => {
                format!("portal:ll:{}:{}", point.lat_e6, point.lng_e6)
            }
        }
    }
}

// =============================================================================
// Observation
// =============================================================================

/// A single client report about a portal.
///
/// The wire format matches what the browser plugin submits:
///
/// ```json
/// {"name": "Fountain", "guid": "a1b2.16", "latE6": 45000000, "lngE6": -120000000}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    pub lat_e6: i32,
    pub lng_e6: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reporter: Option<String>,
    /// When the client saw the portal. Defaults to the time of ingestion.
    #[serde(default, rename = "timestamp", skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Observation {
    pub fn new(name: impl Into<String>, lat_e6: i32, lng_e6: i32) -> Self {
        Self {
            name: name.into(),
            guid: None,
            lat_e6,
            lng_e6,
            region: None,
            reporter: None,
            observed_at: None,
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_reporter(mut self, reporter: impl Into<String>) -> Self {
        self.reporter = Some(reporter.into());
        self
    }

    pub fn with_observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = Some(at);
        self
    }

    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.lat_e6, self.lng_e6)
    }

    /// Guid if present, coordinates otherwise.
    pub fn identity(&self) -> PortalIdentity {
        match &self.guid {
            Some(guid) => PortalIdentity::Guid(guid.clone()),
            None => PortalIdentity::Location(self.location()),
        }
    }

    pub fn content_key(&self) -> String {
        compute_content_key(&self.name, self.guid.as_deref(), self.location())
    }

    /// Normalizes whitespace and empty strings, then checks the observation is usable.
    pub fn normalized(mut self) -> Result<Self, AppError> {
        self.name = self.name.trim().to_string();
        self.guid = self
            .guid
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());
        self.region = self.region.filter(|r| !r.trim().is_empty());

        if self.name.is_empty() {
            return Err(AppError::InvalidObservation(
                "portal name is empty".to_string(),
            ));
        }
        if !self.location().is_valid() {
            return Err(AppError::InvalidObservation(format!(
                "coordinates out of range: {},{}",
                self.lat_e6, self.lng_e6
            )));
        }
        Ok(self)
    }
}

// =============================================================================
// Portal Record
// =============================================================================

/// One applied observation as stored in a record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalVersion {
    pub name: String,
    pub guid: Option<String>,
    pub location: GeoPoint,
    pub region: Option<String>,
    pub reporter: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub content_key: String,
}

impl PortalVersion {
    pub fn from_observation(observation: &Observation, now: DateTime<Utc>) -> Self {
        Self {
            name: observation.name.clone(),
            guid: observation.guid.clone(),
            location: observation.location(),
            region: observation.region.clone(),
            reporter: observation.reporter.clone(),
            observed_at: observation.observed_at.unwrap_or(now),
            content_key: observation.content_key(),
        }
    }
}

/// Canonical portal document.
///
/// The top-level fields always mirror the last entry of `history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalRecord {
    pub id: Uuid,
    pub name: String,
    pub guid: Option<String>,
    pub location: GeoPoint,
    pub region: Option<String>,
    pub reporter: Option<String>,
    pub content_key: String,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<PortalVersion>,
}

impl PortalRecord {
    /// Creates a new record whose history holds just this observation.
    pub fn from_observation(observation: &Observation, now: DateTime<Utc>) -> Self {
        let version = PortalVersion::from_observation(observation, now);
        Self {
            id: Uuid::new_v4(),
            name: version.name.clone(),
            guid: version.guid.clone(),
            location: version.location,
            region: version.region.clone(),
            reporter: version.reporter.clone(),
            content_key: version.content_key.clone(),
            discovered_at: version.observed_at,
            updated_at: now,
            history: vec![version],
        }
    }

    /// Appends the observation to history and overwrites the current fields.
    ///
    /// A guid already present on the record is never cleared by a guid-less
    /// observation.
    pub fn apply(&mut self, observation: &Observation, now: DateTime<Utc>) {
        let version = PortalVersion::from_observation(observation, now);
        self.name = version.name.clone();
        if version.guid.is_some() {
            self.guid = version.guid.clone();
        }
        self.location = version.location;
        self.region = version.region.clone();
        self.reporter = version.reporter.clone();
        self.content_key = version.content_key.clone();
        self.updated_at = now;
        self.history.push(version);
    }

    pub fn identity(&self) -> PortalIdentity {
        match &self.guid {
            Some(guid) => PortalIdentity::Guid(guid.clone()),
            None => PortalIdentity::Location(self.location),
        }
    }

    pub fn intel_url(&self) -> String {
        self.location.intel_url()
    }
}

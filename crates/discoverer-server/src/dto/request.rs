//! Request DTOs for API endpoints.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use discoverer_core::{ExportConfig, Observation};

/// Maximum number of observations accepted in one submission.
pub const MAX_BATCH_SIZE: usize = 5000;

/// One portal observation as submitted by a client.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationDto {
    /// Portal title
    #[schema(example = "Fountain")]
    pub name: String,
    /// Game-assigned portal id, when the client knows it
    #[schema(example = "a1b2c3.16")]
    pub guid: Option<String>,
    /// Latitude in microdegrees
    #[schema(example = 45000000)]
    pub lat_e6: i32,
    /// Longitude in microdegrees
    #[schema(example = -120000000)]
    pub lng_e6: i32,
    /// Free-form region tag
    pub region: Option<String>,
    /// Who submitted the observation
    pub reporter: Option<String>,
    /// When the client saw the portal
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<ObservationDto> for Observation {
    fn from(dto: ObservationDto) -> Self {
        Observation {
            name: dto.name,
            guid: dto.guid,
            lat_e6: dto.lat_e6,
            lng_e6: dto.lng_e6,
            region: dto.region,
            reporter: dto.reporter,
            observed_at: dto.timestamp,
        }
    }
}

/// Request body for a dataset artifact.
#[derive(Debug, Deserialize, ToSchema)]
pub struct DatasetRequestBody {
    /// Source resource. Only the published portal index is accepted.
    pub name: Option<String>,
    /// Output format: kml or csv
    #[schema(example = "kml")]
    pub format: String,
    /// Title, CSV formatting and portal filters
    #[serde(default)]
    #[schema(value_type = Object)]
    pub config: ExportConfig,
}

/// Query parameters addressing a built artifact.
#[derive(Debug, Deserialize, IntoParams, ToSchema)]
pub struct DownloadQuery {
    /// Source resource
    #[param(example = "portal-index")]
    pub name: String,
    /// Output format: kml or csv
    #[param(example = "kml")]
    pub format: String,
    /// SHA-256 of the export configuration
    pub config_hash: String,
}

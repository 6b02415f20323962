//! Portal ingestion and lookup endpoints.

use axum::{
    Json,
    extract::{Path, State},
};

use discoverer_core::{Observation, TracingIngestReporter};

use crate::dto::{IngestResponse, MAX_BATCH_SIZE, ObservationDto, PortalResponse};
use crate::error::ApiError;
use crate::state::AppState;

/// Submit a batch of portal observations.
///
/// Observations are merged in order. Invalid observations and guid conflicts
/// are reported per item and do not fail the batch. When anything changed,
/// the portal index is republished and the new token returned.
#[utoipa::path(
    post,
    path = "/api/v1/portals",
    request_body = Vec<ObservationDto>,
    responses(
        (status = 200, description = "Batch merged", body = IngestResponse),
        (status = 400, description = "Batch too large"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "portals"
)]
pub async fn ingest_portals(
    State(state): State<AppState>,
    Json(batch): Json<Vec<ObservationDto>>,
) -> Result<Json<IngestResponse>, ApiError> {
    if batch.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BadRequest(format!(
            "Batch of {} observations exceeds the maximum of {}",
            batch.len(),
            MAX_BATCH_SIZE
        )));
    }

    let observations: Vec<Observation> = batch.into_iter().map(Observation::from).collect();
    let report = state
        .portal_service
        .ingest_with_reporter(observations, &TracingIngestReporter)
        .await?;

    Ok(Json(IngestResponse::new(
        report.result,
        report.published.map(|t| t.token),
    )))
}

/// Get a portal by guid, with its full history.
#[utoipa::path(
    get,
    path = "/api/v1/portals/{guid}",
    params(
        ("guid" = String, Path, description = "Portal guid")
    ),
    responses(
        (status = 200, description = "Portal found", body = PortalResponse),
        (status = 404, description = "Portal not found"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "portals"
)]
pub async fn get_portal(
    State(state): State<AppState>,
    Path(guid): Path<String>,
) -> Result<Json<PortalResponse>, ApiError> {
    let record = state.portal_service.get_portal(&guid).await?;

    Ok(Json(PortalResponse::from(record)))
}

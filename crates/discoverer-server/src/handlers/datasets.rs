//! Dataset request and download endpoints.

use axum::{
    Json,
    body::Body,
    extract::{Query, State},
    http::{Response, StatusCode, header},
};
use tracing::{info, warn};

use discoverer_core::traits::{ArtifactSink, ArtifactStore, ProcessControl, TaskQueue};
use discoverer_core::{
    ArtifactState, ArtifactStatus, CreateTaskRequest, DatasetAddress, DatasetFormat,
    DatasetRequest, TaskKind,
};

use crate::dto::{
    ArtifactResponse, DatasetRequestBody, DatasetStatusResponse, DownloadQuery, download_ref,
};
use crate::error::ApiError;
use crate::state::AppState;

/// Request a dataset artifact.
///
/// Returns `200` with a download reference when an artifact built from the
/// live index exists. Otherwise a build task is enqueued (at most one per
/// content address), the worker is started if needed, and `202` is returned.
#[utoipa::path(
    post,
    path = "/api/v1/datasets",
    request_body = DatasetRequestBody,
    responses(
        (status = 200, description = "Artifact is ready", body = DatasetStatusResponse),
        (status = 202, description = "Build enqueued or in progress", body = DatasetStatusResponse),
        (status = 400, description = "Invalid format, configuration or source name"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "datasets"
)]
pub async fn request_dataset(
    State(state): State<AppState>,
    Json(body): Json<DatasetRequestBody>,
) -> Result<(StatusCode, Json<DatasetStatusResponse>), ApiError> {
    let format = parse_format(&body.format)?;
    body.config
        .csv
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let name = body.name.unwrap_or_else(|| state.index_name.clone());
    let request = DatasetRequest::new(name, format).with_config(body.config);

    let lookup = state.dataset_cache.lookup(&request).await?;
    let mut response = DatasetStatusResponse {
        status: lookup.state.as_str().to_string(),
        name: lookup.address.name.clone(),
        format: lookup.address.format.to_string(),
        config_hash: lookup.address.config_hash.clone(),
        token: lookup.token.token.clone(),
        download_ref: None,
        task_id: None,
    };

    if lookup.state == ArtifactState::Ready {
        response.download_ref = Some(download_ref(&lookup.address));
        return Ok((StatusCode::OK, Json(response)));
    }

    let dedup_key = lookup.address.lock_key();
    let task = match state.task_repo.find_active_by_key(&dedup_key).await? {
        Some(task) => task,
        None => {
            let task = state
                .task_repo
                .create_task(
                    CreateTaskRequest::new(TaskKind::BuildDataset { request })
                        .with_max_retries(state.worker_settings.max_retries),
                )
                .await?;
            info!(task_id = %task.id, address = %lookup.address, "Enqueued dataset build");
            task
        }
    };
    response.task_id = Some(task.id);

    if let Err(e) = state.worker_control.ensure_running().await {
        warn!(error = %e, control = state.worker_control.name(), "Failed to start worker");
    }

    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Download a built artifact.
#[utoipa::path(
    get,
    path = "/api/v1/datasets/download",
    params(DownloadQuery),
    responses(
        (status = 200, description = "Artifact payload"),
        (status = 400, description = "Invalid format"),
        (status = 404, description = "No artifact at this address"),
        (status = 503, description = "Artifact is still building, retry later"),
    ),
    tag = "datasets"
)]
pub async fn download_dataset(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response<Body>, ApiError> {
    let address = DatasetAddress {
        name: query.name,
        format: parse_format(&query.format)?,
        config_hash: query.config_hash,
    };

    let artifact = state
        .artifact_repo
        .find(&address)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No dataset at {}", address)))?;

    let payload_ref = match (&artifact.status, &artifact.payload_ref) {
        (ArtifactStatus::Ready, Some(payload_ref)) => payload_ref.clone(),
        _ => {
            return Err(ApiError::ServiceUnavailable(format!(
                "Dataset {} is still building, retry later",
                address
            )));
        }
    };

    let payload = state.dataset_cache.sink().open(&payload_ref).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, address.format.content_type())
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}.{}\"",
                address.name,
                address.format.extension()
            ),
        )
        .header(header::ETAG, format!("\"{}\"", artifact.source_token))
        .body(Body::from(payload))
        .map_err(|e| ApiError::Internal(format!("Failed to build response: {}", e)))
}

/// List stored dataset artifacts, most recently updated first.
#[utoipa::path(
    get,
    path = "/api/v1/datasets",
    responses(
        (status = 200, description = "Stored artifacts", body = Vec<ArtifactResponse>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "datasets"
)]
pub async fn list_datasets(
    State(state): State<AppState>,
) -> Result<Json<Vec<ArtifactResponse>>, ApiError> {
    let artifacts = state.artifact_repo.list().await?;
    Ok(Json(
        artifacts.into_iter().map(ArtifactResponse::from).collect(),
    ))
}

fn parse_format(format: &str) -> Result<DatasetFormat, ApiError> {
    format.parse::<DatasetFormat>().map_err(|_| {
        ApiError::BadRequest(format!(
            "Invalid format: '{}'. Supported formats: kml, csv",
            format
        ))
    })
}

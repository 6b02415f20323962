//! OpenAPI documentation configuration.

use utoipa::OpenApi;

use crate::dto::{
    ArtifactResponse, DatasetRequestBody, DatasetStatusResponse, DownloadQuery, HealthResponse,
    IngestResponse, ObservationDto, PortalResponse, PortalVersionDto, RejectionDto,
    ServiceStatus, TaskResponse, WorkerStatusResponse,
};
use crate::handlers::{datasets, health, index, portals, tasks};

/// OpenAPI documentation for the Discoverer API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Discoverer API",
        version = "1.0.0",
        description = "Crowd-sourced portal registry.

Clients submit portal observations; Discoverer merges them into canonical
records with full history, publishes a guid index clients use to spot new or
changed portals, and builds KML/CSV datasets on demand.

## Quick Start

1. Check server health: `GET /api/v1/health`
2. Fetch the index: `GET /api/v1/index`
3. Submit observations: `POST /api/v1/portals`
4. Request a dataset: `POST /api/v1/datasets`
",
        license(
            name = "Apache-2.0",
            url = "https://www.apache.org/licenses/LICENSE-2.0"
        )
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(
        health::health_check,
        portals::ingest_portals,
        portals::get_portal,
        index::get_index,
        datasets::request_dataset,
        datasets::download_dataset,
        datasets::list_datasets,
        tasks::get_task,
        tasks::get_worker_status,
    ),
    components(
        schemas(
            // Request types
            ObservationDto,
            DatasetRequestBody,
            DownloadQuery,
            // Response types
            HealthResponse,
            ServiceStatus,
            IngestResponse,
            RejectionDto,
            PortalResponse,
            PortalVersionDto,
            DatasetStatusResponse,
            ArtifactResponse,
            TaskResponse,
            WorkerStatusResponse,
        )
    ),
    tags(
        (name = "system", description = "System health"),
        (name = "portals", description = "Observation ingestion and portal records"),
        (name = "index", description = "Published guid index"),
        (name = "datasets", description = "Dataset artifacts"),
        (name = "tasks", description = "Task queue and worker status"),
    )
)]
pub struct ApiDoc;

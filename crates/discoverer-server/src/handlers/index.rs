//! Published portal index endpoint.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use discoverer_core::Publication;

use crate::error::ApiError;
use crate::state::AppState;

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Get the published portal index.
///
/// The body maps every known guid to its content key (`k`) and carries the
/// active search region (`r`). `ETag` is the version token and
/// `Last-Modified` the time it was minted; conditional requests that match
/// get `304 Not Modified`.
#[utoipa::path(
    get,
    path = "/api/v1/index",
    responses(
        (status = 200, description = "Current index document"),
        (status = 304, description = "Client copy is current"),
        (status = 500, description = "Internal server error"),
    ),
    tag = "index"
)]
pub async fn get_index(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let publication = state
        .dataset_cache
        .tokens()
        .current(&state.index_name)
        .await?;

    let etag = format!("\"{}\"", publication.token.token);
    let last_modified = publication
        .token
        .minted_at
        .format(HTTP_DATE_FORMAT)
        .to_string();

    let mut response = if is_not_modified(&headers, &publication) {
        StatusCode::NOT_MODIFIED.into_response()
    } else {
        Json(publication.document).into_response()
    };

    let out = response.headers_mut();
    out.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(value) = HeaderValue::from_str(&etag) {
        out.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        out.insert(header::LAST_MODIFIED, value);
    }

    Ok(response)
}

/// Evaluates `If-None-Match`, falling back to `If-Modified-Since` only when
/// the former is absent.
fn is_not_modified(headers: &HeaderMap, publication: &Publication) -> bool {
    if let Some(value) = headers.get(header::IF_NONE_MATCH) {
        let Ok(value) = value.to_str() else {
            return false;
        };
        return value.split(',').map(str::trim).any(|tag| {
            tag == "*" || tag.trim_start_matches("W/").trim_matches('"') == publication.token.token
        });
    }

    headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
        .is_some_and(|since| publication.token.minted_at.timestamp() <= since.timestamp())
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

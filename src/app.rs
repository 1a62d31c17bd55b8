//! The web-facing request surface.
//!
//! One read route resolves derivatives: with a single path segment the
//! segment is the filename and the original is served; with two, the
//! first is the size descriptor. One write route ingests a new original.
//! All failures surface to the client as not-found; details stay in the
//! logs.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::ingest::Ingestor;
use crate::storage::BlobStorage;
use crate::store::DerivativeStore;

/// Application state shared by the handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: DerivativeStore,
    pub ingestor: Arc<Ingestor>,
    pub storage: Arc<dyn BlobStorage>,
}

/// Build the application router under the given route segment.
///
/// An empty segment disables the image endpoints entirely.
pub fn router(state: AppState, route: &str) -> Router {
    let mut router = Router::new();
    if !route.is_empty() {
        router = router
            .route(&format!("/{route}"), post(ingest_image))
            .route(&format!("/{route}/:part1"), get(get_original))
            .route(
                &format!("/{route}/:part1/:part2"),
                get(get_derivative),
            );
    }
    router.with_state(state)
}

/// `GET /<route>/<filename>`: the original artifact.
#[instrument(err, skip(state))]
async fn get_original(
    State(state): State<AppState>,
    Path(part1): Path<String>,
) -> Result<axum::response::Response> {
    serve(&state, &part1, None).await
}

/// `GET /<route>/<descriptor>/<filename>`: a derivative, generated on
/// first request.
#[instrument(err, skip(state))]
async fn get_derivative(
    State(state): State<AppState>,
    Path((part1, part2)): Path<(String, String)>,
) -> Result<axum::response::Response> {
    serve(&state, &part2, Some(&part1)).await
}

async fn serve(
    state: &AppState,
    filename: &str,
    descriptor: Option<&str>,
) -> Result<axum::response::Response> {
    let path = state.store.resolve(filename, descriptor).await?;
    let bytes = state.storage.get(&path).await?;

    // Derivatives keep the original's codec, so the stored filename's
    // extension is authoritative for the content type.
    let mime = mime_guess::from_path(filename).first_or_octet_stream();
    let response = axum::response::Response::builder()
        .header("Content-Type", mime.as_ref())
        .header("Cache-Control", "public, max-age=31536000, immutable")
        .body(axum::body::Body::from(bytes))
        .context("derivative response")?
        .into_response();
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct IngestParams {
    /// Original filename to record, if the caller knows one.
    name: Option<String>,
    /// Ingest by downloading this URL instead of the request body.
    url: Option<String>,
}

/// `POST /<route>`: ingest a new original from the raw request body, or
/// from a remote URL given as `?url=`.
#[instrument(err, skip(state, body), fields(len = body.len()))]
async fn ingest_image(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let record = match params.url {
        Some(url) => state.ingestor.from_url(&url, params.name).await?,
        None => {
            if body.is_empty() {
                return Err(Error::NotFound(anyhow!("empty upload body")));
            }
            state
                .ingestor
                .from_bytes(body.to_vec(), params.name)
                .await?
        }
    };
    Ok((StatusCode::CREATED, Json(record)))
}

//! Backend HTTP surface.
//!
//! Thin axum adapters over the stores, the cluster seam, and the
//! keychain. Domain errors map onto HTTP statuses here; everything of
//! substance happens in the layers below.

pub mod binding;
pub mod data;

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use crate::{
    cluster::Cluster,
    errors::KnitError,
    keychain::KeyProvider,
    store::{DataStore, RunStore},
};

/// Shared state of the backend handlers.
pub struct BackendState {
    pub data: Arc<dyn DataStore>,
    pub runs: Arc<dyn RunStore>,
    pub cluster: Arc<dyn Cluster>,
    pub keys: Arc<dyn KeyProvider>,
    /// Lease duration for data agents and ingress pseudo runs.
    pub agent_lease: Duration,
    /// How long a data agent spawn may take before `DeadlineExceeded`.
    pub spawn_timeout: Duration,
    /// Validity window of import tokens.
    pub import_token_ttl: Duration,
}

impl BackendState {
    pub fn new(
        data: Arc<dyn DataStore>,
        runs: Arc<dyn RunStore>,
        cluster: Arc<dyn Cluster>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        Self {
            data,
            runs,
            cluster,
            keys,
            agent_lease: Duration::from_secs(300),
            spawn_timeout: Duration::from_secs(180),
            import_token_ttl: Duration::from_secs(3 * 60 * 60),
        }
    }
}

/// The backend router.
pub fn backend_router(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/api/backends/data/{knit_id}", get(data::get_data))
        .route("/api/backends/data/", post(data::post_data))
        .route("/api/backends/data/import/begin", post(data::import_begin))
        .route("/api/backends/data/import/end", post(data::import_end))
        .with_state(state)
}

/// A domain error annotated with the HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: KnitError,
}

impl ApiError {
    pub fn new(status: StatusCode, error: KnitError) -> Self {
        Self { status, error }
    }

    pub fn internal(error: KnitError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::debug!(status = %self.status, error = %self.error, "request failed");
        (self.status, self.error.to_string()).into_response()
    }
}

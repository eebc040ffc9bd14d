//! Control surface: the HTTP endpoint that hands out pool endpoints.
//!
//! `GET /` returns one ready endpoint as plain text, consuming its one-shot
//! eligibility. `GET /stats` returns the counter snapshot as JSON.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tracing::{debug, info};

use crate::pool::{PoolError, PoolManager};
use crate::proxy::LISTEN_ADDR;

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<PoolManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(acquire))
        .route("/stats", get(stats))
        .with_state(state)
}

async fn acquire(State(state): State<AppState>) -> Response {
    let pool = &state.pool;
    pool.stats().total_requests.fetch_add(1, Ordering::Relaxed);

    match pool.reserve_ready_port() {
        Ok(lease) => {
            pool.stats().handed_out.fetch_add(1, Ordering::Relaxed);
            let endpoint = format!("{}:{}", LISTEN_ADDR, lease.port);
            info!(%endpoint, generation = lease.generation, "endpoint handed out");
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/plain"),
                    (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                ],
                endpoint,
            )
                .into_response()
        }
        Err(PoolError::NoReady) => {
            debug!("acquire with no ready port");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [
                    (header::CONTENT_TYPE, "text/plain"),
                    (header::RETRY_AFTER, "1"),
                ],
                "no ready endpoint, back off and retry\n",
            )
                .into_response()
        }
        Err(PoolError::Shutdown) => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "shutting down\n",
        )
            .into_response(),
    }
}

async fn stats(State(state): State<AppState>) -> Response {
    Json(state.pool.snapshot()).into_response()
}

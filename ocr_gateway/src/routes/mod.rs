mod health;
mod metrics;
mod stream;
mod upload;

use crate::server::SharedState;
use axum::{routing::get, routing::post, Router};

use health::{healthcheck, index};
use metrics::metrics_handler;
use stream::{stream_with_generated_id, stream_with_id};
use upload::upload_image;

pub fn api_routes() -> Router<SharedState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(healthcheck))
        .route("/metrics", get(metrics_handler))
        .route("/ocr", post(upload_image))
        .route("/ocr_ws", get(stream_with_generated_id))
        .route("/ocr_ws/{client_id}", get(stream_with_id))
}

use axum::{response::IntoResponse, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
}

#[derive(Serialize, Deserialize)]
pub struct Banner {
    message: String,
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(Status {
        status: "Available".into(),
    })
}

pub async fn index() -> impl IntoResponse {
    Json(Banner {
        message: "OCR Viewer".into(),
    })
}

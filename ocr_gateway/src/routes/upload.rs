use crate::{
    decoder::{DecodeError, OwnedPayload},
    detector::InferenceError,
    encoder::{EncodeError, UploadResult},
    frame::SessionId,
    queue::QueueError,
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

const FILE_FIELD: &str = "file";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("request has no `file` field")]
    MissingFile,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("encoder task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::Multipart(e) => e.status(),
            UploadError::MissingFile => StatusCode::BAD_REQUEST,
            UploadError::Decode(DecodeError::UnsupportedFormat) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            UploadError::Decode(DecodeError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Decode(DecodeError::Task(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            UploadError::Decode(_) => StatusCode::BAD_REQUEST,
            UploadError::Queue(QueueError::Backpressure { .. }) => StatusCode::TOO_MANY_REQUESTS,
            UploadError::Queue(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::Inference(_) => StatusCode::BAD_GATEWAY,
            UploadError::Encode(_) | UploadError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Multipart(_) | UploadError::MissingFile => "bad_request",
            UploadError::Decode(_) => "decode",
            UploadError::Queue(QueueError::Backpressure { .. }) => "backpressure",
            UploadError::Queue(_) => "unavailable",
            UploadError::Inference(_) => "inference",
            UploadError::Encode(_) | UploadError::Join(_) => "encode",
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("upload failed: {}", self);
        } else {
            tracing::info!("upload rejected: {}", self);
        }

        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Decodes one uploaded image, waits for its detections and answers with them.
#[instrument(skip(state, multipart))]
pub async fn upload_image(
    State(state): State<SharedState>,
    multipart: Multipart,
) -> Result<Json<UploadResult>, UploadError> {
    let image_data = read_file_field(multipart).await?;

    let frame = state
        .decoder
        .decode_blocking(SessionId::generate(), OwnedPayload::Binary(image_data))
        .await
        .inspect_err(|_| state.metrics.record_rejection("decode"))?;

    if let Some(archive) = &state.archive {
        archive.spawn_save(&frame);
    }

    state.metrics.record_submission("ocr");
    let mut result = state.queue.infer_once(frame).await?;
    if let Some(error) = result.error.take() {
        return Err(UploadError::Inference(error));
    }

    let encoder = state.encoder.clone();
    let payload = tokio::task::spawn_blocking(move || encoder.encode_upload(&result)).await??;

    Ok(Json(payload))
}

async fn read_file_field(mut multipart: Multipart) -> Result<Bytes, UploadError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(FILE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }

    Err(UploadError::MissingFile)
}

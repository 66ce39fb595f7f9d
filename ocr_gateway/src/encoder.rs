use crate::bounding_box::Detection;
use crate::labels::LabelPalette;
use crate::queue::DetectionResult;
use base64::{engine::general_purpose::STANDARD, Engine};
use image::{ImageFormat, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use serde::Serialize;
use std::borrow::Cow;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

const PNG_DATA_URI_PREFIX: &str = "data:image/png;base64,";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("failed to encode preview: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to serialize payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reply sent on the stream endpoint for every accepted frame.
#[derive(Debug, Serialize)]
pub struct StreamResult<'a> {
    pub id: Uuid,
    pub sequence: u64,
    pub prediction: &'a [Detection],
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of a successful upload response.
#[derive(Debug, Serialize)]
pub struct UploadResult {
    pub id: Uuid,
    pub detections: Vec<Detection>,
    pub preview: String,
}

/// Out-of-band notifications on the stream endpoint.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent<'a> {
    Joined { client_id: &'a str },
    Left { client_id: &'a str },
    Error { kind: &'a str, message: String },
}

impl SessionEvent<'_> {
    pub fn to_json(&self) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone)]
pub struct ResultEncoder {
    palette: Arc<LabelPalette>,
    annotate: bool,
}

impl ResultEncoder {
    pub fn new(palette: Arc<LabelPalette>, annotate: bool) -> Self {
        Self { palette, annotate }
    }

    pub fn encode_stream(&self, result: &DetectionResult) -> Result<String, EncodeError> {
        let message = StreamResult {
            id: result.id,
            sequence: result.sequence,
            prediction: &result.detections,
            output: self.preview_data_uri(result)?,
            error: result.error.as_ref().map(|e| e.to_string()),
        };

        Ok(serde_json::to_string(&message)?)
    }

    pub fn encode_upload(&self, result: &DetectionResult) -> Result<UploadResult, EncodeError> {
        Ok(UploadResult {
            id: result.id,
            detections: result.detections.clone(),
            preview: self.preview_data_uri(result)?,
        })
    }

    pub fn preview_data_uri(&self, result: &DetectionResult) -> Result<String, EncodeError> {
        let preview = self.render_preview(result);
        encode_png_data_uri(&preview)
    }

    /// The frame's pixels, with detection boxes outlined when annotation is on.
    pub fn render_preview<'a>(&self, result: &'a DetectionResult) -> Cow<'a, RgbImage> {
        if !self.annotate || result.detections.is_empty() {
            return Cow::Borrowed(result.preview.as_ref());
        }

        let mut image = result.preview.as_ref().clone();
        let (width, height) = image.dimensions();

        for detection in &result.detections {
            let bbox = detection.bbox.clip(width, height);
            let rect_width = bbox.width().round() as u32;
            let rect_height = bbox.height().round() as u32;
            if rect_width == 0 || rect_height == 0 {
                continue;
            }

            let rect = Rect::at(bbox.x1 as i32, bbox.y1 as i32).of_size(rect_width, rect_height);
            draw_hollow_rect_mut(&mut image, rect, self.palette.color_for(&detection.label));
        }

        Cow::Owned(image)
    }
}

pub fn encode_png_data_uri(image: &RgbImage) -> Result<String, EncodeError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;

    Ok(format!(
        "{}{}",
        PNG_DATA_URI_PREFIX,
        STANDARD.encode(buffer.into_inner())
    ))
}

use crate::config::DecoderConfig;
use crate::frame::{Frame, SessionId};
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use bytes::Bytes;
use image::{ImageError, ImageReader, Limits, RgbImage};
use std::io::Cursor;
use thiserror::Error;

/// Accepts payloads with, without, or with partial `=` padding.
const PADDING_TOLERANT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("malformed base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unsupported image format")]
    UnsupportedFormat,
    #[error("image exceeds the {0}px dimension limit")]
    DimensionsTooLarge(u32),
    #[error("corrupt or truncated image data: {0}")]
    Corrupt(String),
    #[error("decoder task failed: {0}")]
    Task(String),
}

/// Raw socket or upload input, before it becomes a [`Frame`].
#[derive(Debug, Clone, Copy)]
pub enum FramePayload<'a> {
    Binary(&'a [u8]),
    /// `data:image/<fmt>;base64,<payload>`, or bare base64 text.
    Text(&'a str),
}

/// Owned counterpart of [`FramePayload`] that can move onto a blocking thread.
#[derive(Debug, Clone)]
pub enum OwnedPayload {
    Binary(Bytes),
    Text(String),
}

impl OwnedPayload {
    pub fn as_payload(&self) -> FramePayload<'_> {
        match self {
            OwnedPayload::Binary(bytes) => FramePayload::Binary(bytes),
            OwnedPayload::Text(text) => FramePayload::Text(text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_payload_bytes: usize,
    max_dimension: u32,
}

impl FrameDecoder {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes,
            max_dimension: config.max_dimension,
        }
    }

    pub fn decode(
        &self,
        session_id: SessionId,
        payload: FramePayload<'_>,
    ) -> Result<Frame, DecodeError> {
        let image = match payload {
            FramePayload::Binary(bytes) => self.decode_image(bytes)?,
            FramePayload::Text(text) => {
                let bytes = decode_data_uri(text, self.max_payload_bytes)?;
                self.decode_image(&bytes)?
            }
        };

        Ok(Frame::new(session_id, image))
    }

    /// [`decode`](Self::decode) on the blocking pool, keeping pixel work off
    /// the runtime threads that serve sockets.
    pub async fn decode_blocking(
        &self,
        session_id: SessionId,
        payload: OwnedPayload,
    ) -> Result<Frame, DecodeError> {
        let decoder = self.clone();
        tokio::task::spawn_blocking(move || decoder.decode(session_id, payload.as_payload()))
            .await
            .map_err(|e| DecodeError::Task(e.to_string()))?
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    fn decode_image(&self, bytes: &[u8]) -> Result<RgbImage, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        if bytes.len() > self.max_payload_bytes {
            return Err(DecodeError::TooLarge {
                size: bytes.len(),
                limit: self.max_payload_bytes,
            });
        }

        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| DecodeError::Corrupt(e.to_string()))?;

        if reader.format().is_none() {
            return Err(DecodeError::UnsupportedFormat);
        }

        let mut limits = Limits::default();
        limits.max_image_width = Some(self.max_dimension);
        limits.max_image_height = Some(self.max_dimension);
        reader.limits(limits);

        let image = reader.decode().map_err(|e| match e {
            ImageError::Unsupported(_) => DecodeError::UnsupportedFormat,
            ImageError::Limits(_) => DecodeError::DimensionsTooLarge(self.max_dimension),
            other => DecodeError::Corrupt(other.to_string()),
        })?;

        Ok(image.into_rgb8())
    }
}

/// Everything after the first `,` is base64; without a `,` the whole text is.
///
/// Payloads that would decode to more than `limit` bytes are refused before
/// anything is allocated.
pub fn decode_data_uri(text: &str, limit: usize) -> Result<Vec<u8>, DecodeError> {
    let encoded = match text.find(',') {
        Some(index) => &text[index + 1..],
        None => text,
    };

    let symbols = encoded
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b'=')
        .count();
    let decoded_size = symbols / 4 * 3;
    if decoded_size > limit {
        return Err(DecodeError::TooLarge {
            size: decoded_size,
            limit,
        });
    }

    let compact: String = encoded
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let unpadded = compact.trim_end_matches('=');

    if unpadded.is_empty() {
        return Err(DecodeError::Empty);
    }

    Ok(PADDING_TOLERANT.decode(unpadded)?)
}

#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, Rgb, RgbImage};
use ocr_gateway::{
    bounding_box::Detection,
    config::{
        ArchiveConfig, Config, DecoderConfig, DetectorConfig, LogLevel, PreviewConfig,
        QueueConfig, ServerConfig, SessionConfig,
    },
    detector::{Detector, InferenceError},
    frame::Frame,
    server::{build_router, SharedState},
};
use std::{io::Cursor, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

pub fn config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        log_level: LogLevel::Debug,
        decoder: DecoderConfig::default(),
        queue: QueueConfig {
            workers: 4,
            ..QueueConfig::default()
        },
        session: SessionConfig::default(),
        detector: DetectorConfig::default(),
        preview: PreviewConfig::default(),
        archive: ArchiveConfig::default(),
    }
}

/// Sleeps according to the frame's red channel, and fails when asked to.
pub struct PacedDetector {
    pub delay_ms: fn(u8) -> u64,
    pub fail: bool,
    pub concurrency: usize,
}

impl PacedDetector {
    pub fn instant() -> Self {
        Self {
            delay_ms: |_| 0,
            fail: false,
            concurrency: 4,
        }
    }
}

#[async_trait]
impl Detector for PacedDetector {
    async fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let tag = frame.image.get_pixel(0, 0)[0];
        let delay = (self.delay_ms)(tag);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.fail {
            return Err(InferenceError::Unavailable("model offline".to_string()));
        }
        Ok(Vec::new())
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }

    fn name(&self) -> &str {
        "paced"
    }
}

pub fn state(config: &Config, detector: impl Detector) -> SharedState {
    SharedState::new(config, Arc::new(detector)).unwrap()
}

pub fn router(config: &Config, state: SharedState) -> axum::Router {
    build_router(state, config.decoder.max_payload_bytes)
}

pub async fn spawn_server(config: &Config, state: SharedState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = router(config, state);

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    addr
}

pub fn solid_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb(color));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

pub fn decode_data_uri_png(data_uri: &str) -> RgbImage {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let encoded = data_uri
        .strip_prefix("data:image/png;base64,")
        .expect("preview is a png data uri");
    let bytes = STANDARD.decode(encoded).unwrap();
    image::load_from_memory_with_format(&bytes, ImageFormat::Png)
        .unwrap()
        .into_rgb8()
}

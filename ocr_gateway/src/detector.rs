use crate::bounding_box::{BoundingBox, Detection};
use crate::config::DetectorConfig;
use crate::frame::Frame;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum InferenceError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported input shape {width}x{height}")]
    UnsupportedInput { width: u32, height: u32 },
    #[error("inference timed out after {0}ms")]
    Timeout(u64),
    #[error("inference failed: {0}")]
    Failed(String),
}

/// Boundary to whatever model performs detection.
///
/// `max_concurrency` declares how many `infer` calls the implementation
/// tolerates at once; the inference queue never exceeds it.
#[async_trait]
pub trait Detector: Send + Sync + 'static {
    async fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError>;

    fn max_concurrency(&self) -> usize {
        1
    }

    fn name(&self) -> &str;
}

/// Returns a fixed set of detections for every frame.
#[derive(Debug, Clone)]
pub struct StaticDetector {
    detections: Vec<Detection>,
    delay: Duration,
    max_concurrency: usize,
}

impl StaticDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        let detections = config
            .detections
            .iter()
            .map(|d| Detection {
                label: d.label.clone(),
                confidence: d.confidence,
                bbox: BoundingBox {
                    x1: d.x1,
                    y1: d.y1,
                    x2: d.x2,
                    y2: d.y2,
                },
            })
            .collect();

        Self {
            detections,
            delay: Duration::from_millis(config.delay_ms),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// A detector that never finds anything.
    pub fn empty() -> Self {
        Self::new(&DetectorConfig::default())
    }
}

#[async_trait]
impl Detector for StaticDetector {
    async fn infer(&self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(InferenceError::UnsupportedInput {
                width: frame.width(),
                height: frame.height(),
            });
        }

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let detections = self
            .detections
            .iter()
            .map(|d| Detection {
                bbox: d.bbox.clip(frame.width(), frame.height()),
                ..d.clone()
            })
            .collect();

        Ok(detections)
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn name(&self) -> &str {
        "static"
    }
}

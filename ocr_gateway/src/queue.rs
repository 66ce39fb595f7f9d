use crate::bounding_box::Detection;
use crate::config::QueueConfig;
use crate::detector::{Detector, InferenceError};
use crate::frame::{Frame, SessionId};
use crate::telemetry::Metrics;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::timeout;
use tracing::instrument;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("session queue is full ({capacity} frames pending), retry later")]
    Backpressure { capacity: usize },
    #[error("frame belongs to session {frame} but was submitted on {lane}")]
    WrongSession { lane: SessionId, frame: SessionId },
    #[error("inference queue is closed")]
    Closed,
}

/// Receipt for an accepted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub frame_id: Uuid,
    pub sequence: u64,
}

#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Id of the frame this result answers.
    pub id: Uuid,
    pub session_id: SessionId,
    pub sequence: u64,
    pub detections: Vec<Detection>,
    pub preview: Arc<RgbImage>,
    pub error: Option<InferenceError>,
}

impl DetectionResult {
    fn completed(frame: &Frame, sequence: u64, detections: Vec<Detection>) -> Self {
        Self {
            id: frame.id,
            session_id: frame.session_id.clone(),
            sequence,
            detections,
            preview: frame.image.clone(),
            error: None,
        }
    }

    fn failed(frame: &Frame, sequence: u64, error: InferenceError) -> Self {
        Self {
            error: Some(error),
            ..Self::completed(frame, sequence, Vec::new())
        }
    }
}

struct Job {
    frame: Frame,
    sequence: u64,
    permit: OwnedSemaphorePermit,
}

/// A result together with the capacity slot its frame occupied. The slot is
/// freed once the result has been taken by the session.
struct Delivery {
    result: DetectionResult,
    _permit: OwnedSemaphorePermit,
}

struct Shared {
    detector: Arc<dyn Detector>,
    workers: Arc<Semaphore>,
    session_capacity: usize,
    pipeline_depth: usize,
    inference_timeout: Duration,
    submit_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

/// Hands frames to the detector through a global worker pool while keeping
/// results of each session in submission order.
#[derive(Clone)]
pub struct InferenceQueue {
    shared: Arc<Shared>,
}

impl InferenceQueue {
    pub fn new(detector: Arc<dyn Detector>, config: &QueueConfig, metrics: Arc<Metrics>) -> Self {
        let workers = config.workers.min(detector.max_concurrency()).max(1);

        tracing::info!(
            detector = detector.name(),
            workers,
            session_capacity = config.session_capacity,
            pipeline_depth = config.pipeline_depth,
            "Inference queue ready"
        );

        let submit_timeout =
            (config.submit_timeout_ms > 0).then(|| Duration::from_millis(config.submit_timeout_ms));

        Self {
            shared: Arc::new(Shared {
                detector,
                // Semaphore waiters are served FIFO, which keeps sessions taking turns.
                workers: Arc::new(Semaphore::new(workers)),
                session_capacity: config.session_capacity.max(1),
                pipeline_depth: config.pipeline_depth.max(1),
                inference_timeout: Duration::from_millis(config.inference_timeout_ms),
                submit_timeout,
                metrics,
            }),
        }
    }

    /// Opens the ordered queue of one session.
    pub fn open_lane(&self, session_id: SessionId) -> Lane {
        let capacity = self.shared.session_capacity;
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        tokio::spawn(run_lane(self.shared.clone(), job_rx, result_tx));

        Lane {
            submitter: LaneSubmitter {
                session_id,
                jobs: job_tx,
                capacity: Arc::new(Semaphore::new(capacity)),
                limit: capacity,
                next_sequence: Mutex::new(0),
                submit_timeout: self.shared.submit_timeout,
            },
            results: LaneResults { results: result_rx },
        }
    }

    /// Runs a single frame outside of any session and waits for its result.
    #[instrument(skip(self, frame), fields(frame_id = %frame.id))]
    pub async fn infer_once(&self, frame: Frame) -> Result<DetectionResult, QueueError> {
        let mut lane = self.open_lane(frame.session_id.clone());
        lane.submit(frame).await?;
        lane.await_next_result().await.ok_or(QueueError::Closed)
    }
}

pub struct Lane {
    submitter: LaneSubmitter,
    results: LaneResults,
}

impl Lane {
    pub async fn submit(&self, frame: Frame) -> Result<Ticket, QueueError> {
        self.submitter.submit(frame).await
    }

    pub async fn await_next_result(&mut self) -> Option<DetectionResult> {
        self.results.next().await
    }

    /// Separates the submitting half from the receiving half so they can live
    /// in different tasks.
    pub fn split(self) -> (LaneSubmitter, LaneResults) {
        (self.submitter, self.results)
    }
}

pub struct LaneSubmitter {
    session_id: SessionId,
    jobs: mpsc::Sender<Job>,
    capacity: Arc<Semaphore>,
    limit: usize,
    /// Held while a job is enqueued so sequence order matches queue order.
    next_sequence: Mutex<u64>,
    submit_timeout: Option<Duration>,
}

impl LaneSubmitter {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn submit(&self, frame: Frame) -> Result<Ticket, QueueError> {
        if frame.session_id != self.session_id {
            return Err(QueueError::WrongSession {
                lane: self.session_id.clone(),
                frame: frame.session_id.clone(),
            });
        }

        let permit = self.reserve().await?;
        let frame_id = frame.id;

        let mut next_sequence = self.next_sequence.lock();
        let sequence = *next_sequence;
        self.jobs
            .try_send(Job {
                frame,
                sequence,
                permit,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Backpressure {
                    capacity: self.limit,
                },
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })?;
        *next_sequence += 1;
        drop(next_sequence);

        tracing::debug!(
            session_id = %self.session_id,
            %frame_id,
            sequence,
            "Frame accepted"
        );

        Ok(Ticket { frame_id, sequence })
    }

    async fn reserve(&self) -> Result<OwnedSemaphorePermit, QueueError> {
        let backpressure = QueueError::Backpressure {
            capacity: self.limit,
        };

        match self.submit_timeout {
            None => self
                .capacity
                .clone()
                .try_acquire_owned()
                .map_err(|e| match e {
                    TryAcquireError::NoPermits => backpressure,
                    TryAcquireError::Closed => QueueError::Closed,
                }),
            Some(wait) => match timeout(wait, self.capacity.clone().acquire_owned()).await {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(QueueError::Closed),
                Err(_) => Err(backpressure),
            },
        }
    }
}

pub struct LaneResults {
    results: mpsc::Receiver<Delivery>,
}

impl LaneResults {
    /// Next result in submission order, `None` once the lane is drained and
    /// its submitter dropped.
    pub async fn next(&mut self) -> Option<DetectionResult> {
        self.results.recv().await.map(|delivery| delivery.result)
    }
}

async fn run_lane(
    shared: Arc<Shared>,
    mut jobs: mpsc::Receiver<Job>,
    results: mpsc::Sender<Delivery>,
) {
    let mut in_flight: FuturesOrdered<BoxFuture<'static, Delivery>> = FuturesOrdered::new();
    let mut accepting = true;

    loop {
        tokio::select! {
            biased;
            Some(delivery) = in_flight.next(), if !in_flight.is_empty() => {
                let (id, sequence) = (delivery.result.id, delivery.result.sequence);
                if results.send(delivery).await.is_err() {
                    tracing::debug!(frame_id = %id, sequence, "Session gone, discarding result");
                }
            }
            job = jobs.recv(), if accepting && in_flight.len() < shared.pipeline_depth => {
                match job {
                    Some(job) => in_flight.push_back(dispatch(&shared, job)),
                    None => accepting = false,
                }
            }
            else => break,
        }
    }
}

/// Runs the detector on its own task so a slow reader of this lane never
/// holds a worker slot.
fn dispatch(shared: &Arc<Shared>, job: Job) -> BoxFuture<'static, Delivery> {
    let Job {
        frame,
        sequence,
        permit,
    } = job;
    let handle = tokio::spawn(shared.clone().process(frame.clone(), sequence));

    async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(frame_id = %frame.id, error = %e, "Detector task aborted");
                DetectionResult::failed(
                    &frame,
                    sequence,
                    InferenceError::Failed(format!("detector task aborted: {}", e)),
                )
            }
        };

        Delivery {
            result,
            _permit: permit,
        }
    }
    .boxed()
}

impl Shared {
    async fn process(self: Arc<Self>, frame: Frame, sequence: u64) -> DetectionResult {
        let _worker = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return DetectionResult::failed(
                    &frame,
                    sequence,
                    InferenceError::Unavailable("worker pool closed".to_string()),
                )
            }
        };

        let started = Instant::now();
        let outcome = timeout(self.inference_timeout, self.detector.infer(&frame)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(detections)) => DetectionResult::completed(&frame, sequence, detections),
            Ok(Err(e)) => DetectionResult::failed(&frame, sequence, e),
            Err(_) => DetectionResult::failed(
                &frame,
                sequence,
                InferenceError::Timeout(self.inference_timeout.as_millis() as u64),
            ),
        };

        self.metrics
            .record_inference(elapsed_ms, result.error.is_some());

        match &result.error {
            None => tracing::debug!(
                session_id = %frame.session_id,
                frame_id = %frame.id,
                sequence,
                detections = result.detections.len(),
                elapsed_ms,
                "Inference complete"
            ),
            Some(e) => tracing::warn!(
                session_id = %frame.session_id,
                frame_id = %frame.id,
                sequence,
                error = %e,
                "Inference failed"
            ),
        }

        result
    }
}

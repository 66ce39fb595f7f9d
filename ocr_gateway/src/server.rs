use crate::{
    archive::FrameArchive,
    config::{Config, SessionConfig},
    decoder::FrameDecoder,
    detector::Detector,
    encoder::ResultEncoder,
    labels::LabelPalette,
    queue::InferenceQueue,
    routes::api_routes,
    session::SessionManager,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};

/// Multipart framing on top of the image itself.
const BODY_LIMIT_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct SharedState {
    pub decoder: FrameDecoder,
    pub queue: InferenceQueue,
    pub sessions: Arc<SessionManager>,
    pub encoder: ResultEncoder,
    pub archive: Option<FrameArchive>,
    pub session_config: SessionConfig,
    pub metrics: Arc<Metrics>,
}

impl SharedState {
    pub fn new(config: &Config, detector: Arc<dyn Detector>) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let palette = match &config.detector.labels_file {
            Some(path) => {
                let palette = LabelPalette::load(path)?;
                tracing::info!(labels = palette.len(), "loaded label palette from {:?}", path);
                palette
            }
            None => LabelPalette::default(),
        };

        tracing::info!(
            detector = detector.name(),
            max_concurrency = detector.max_concurrency(),
            "detector ready"
        );

        Ok(Self {
            decoder: FrameDecoder::new(&config.decoder),
            queue: InferenceQueue::new(detector, &config.queue, metrics.clone()),
            sessions: Arc::new(SessionManager::new(
                config.session.outbound_capacity,
                metrics.clone(),
            )),
            encoder: ResultEncoder::new(Arc::new(palette), config.preview.annotate),
            archive: FrameArchive::from_config(&config.archive)?,
            session_config: config.session.clone(),
            metrics,
        })
    }
}

/// All routes with request bodies capped at the decoder's payload limit.
pub fn build_router(state: SharedState, max_payload_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(
            max_payload_bytes.saturating_add(BODY_LIMIT_OVERHEAD),
        ))
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();

        let router = build_router(state, config.decoder.max_payload_bytes);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}

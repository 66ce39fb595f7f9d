use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::collections::HashSet;

pub struct Metrics {
    frames_submitted: IntCounterVec,
    frames_rejected: IntCounterVec,
    inference_duration: Histogram,
    inference_failures: IntCounter,
    active_sessions: IntGauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let frames_submitted = IntCounterVec::new(
            Opts::new("frames_submitted_total", "Frames accepted by the inference queue"),
            &["route"],
        )?;

        let frames_rejected = IntCounterVec::new(
            Opts::new("frames_rejected_total", "Frames refused before inference"),
            &["reason"],
        )?;

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let inference_duration = Histogram::with_opts(
            HistogramOpts::new(
                "inference_duration_ms",
                "Duration of detector calls in milliseconds",
            )
            .buckets(boundaries),
        )?;

        let inference_failures = IntCounter::new(
            "inference_failures_total",
            "Detector calls that ended in an error or timeout",
        )?;

        let active_sessions = IntGauge::new("active_sessions", "Open streaming sessions")?;

        registry.register(Box::new(frames_submitted.clone()))?;
        registry.register(Box::new(frames_rejected.clone()))?;
        registry.register(Box::new(inference_duration.clone()))?;
        registry.register(Box::new(inference_failures.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Metrics {
            frames_submitted,
            frames_rejected,
            inference_duration,
            inference_failures,
            active_sessions,
            registry,
        })
    }

    pub fn record_submission(&self, route: &str) {
        self.frames_submitted.with_label_values(&[route]).inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.frames_rejected.with_label_values(&[reason]).inc();
    }

    pub fn record_inference(&self, duration_ms: u64, failed: bool) {
        self.inference_duration.observe(duration_ms as f64);
        if failed {
            self.inference_failures.inc();
        }
    }

    pub fn session_opened(&self) {
        self.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

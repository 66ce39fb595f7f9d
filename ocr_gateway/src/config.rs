use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DecoderConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            max_dimension: default_max_dimension(),
        }
    }
}

fn default_max_payload_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_max_dimension() -> u32 {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Frames a single session may have accepted but not yet answered.
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
    /// Frames of a single session allowed inside the detector at the same time.
    #[serde(default = "default_pipeline_depth")]
    pub pipeline_depth: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_inference_timeout_ms")]
    pub inference_timeout_ms: u64,
    /// 0 rejects immediately when the session is at capacity.
    #[serde(default)]
    pub submit_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            session_capacity: default_session_capacity(),
            pipeline_depth: default_pipeline_depth(),
            workers: default_workers(),
            inference_timeout_ms: default_inference_timeout_ms(),
            submit_timeout_ms: 0,
        }
    }
}

fn default_session_capacity() -> usize {
    8
}

fn default_pipeline_depth() -> usize {
    2
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_inference_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: default_outbound_capacity(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

fn default_outbound_capacity() -> usize {
    64
}

fn default_close_grace_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StaticDetection {
    pub label: String,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectorConfig {
    pub labels_file: Option<PathBuf>,
    #[serde(default = "default_detector_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub detections: Vec<StaticDetection>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            labels_file: None,
            max_concurrency: default_detector_concurrency(),
            delay_ms: 0,
            detections: Vec::new(),
        }
    }
}

fn default_detector_concurrency() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreviewConfig {
    #[serde(default = "default_annotate")]
    pub annotate: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            annotate: default_annotate(),
        }
    }
}

fn default_annotate() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

impl ArchiveConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.directory.is_none() {
            return Err("archive is enabled but no archive directory is set".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("no current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("OCR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.archive.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}

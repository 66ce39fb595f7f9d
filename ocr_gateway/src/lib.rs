mod app;
mod routes;

pub mod archive;
pub mod bounding_box;
pub mod config;
pub mod decoder;
pub mod detector;
pub mod encoder;
pub mod frame;
pub mod labels;
pub mod queue;
pub mod server;
pub mod session;
pub mod telemetry;

pub use app::start_app;

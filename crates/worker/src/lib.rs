pub mod app;
pub mod config;
pub mod telemetry;

// Re-export main types
pub use app::{build_handlers, Worker};
pub use config::{CallbackEndpoint, WorkerConfig};
pub use telemetry::{init_telemetry, TelemetryConfig};

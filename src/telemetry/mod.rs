pub mod ingest;
pub mod stale;

pub use ingest::{ingest, DiskTelemetry, JobTelemetry};
pub use stale::StaleJobDetector;

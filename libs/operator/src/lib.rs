pub mod controller;
pub mod metrics;
pub mod prometheus_exporter;
pub mod telemetry;

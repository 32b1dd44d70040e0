// observability/mod.rs - Logging and Metrics

//! Structured logging (`tracing`) and engine metrics (`metrics` facade).
//! The engine records; exporters are wired by the embedding host.

pub mod metrics;
pub mod tracing_setup;

pub use tracing_setup::{TracingConfig, TracingFormat, init_tracing};

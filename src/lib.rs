//! Real-time fault-risk scoring for streamed vehicle telemetry.
//!
//! Each reading updates its vehicle's rolling RPM window in [`store`], is
//! turned into a feature vector by [`features`], and is scored by the
//! artifact-backed classifier in [`model`]. [`server`] exposes this over a
//! single-shot HTTP endpoint and a WebSocket stream.

pub mod alerts;
pub mod config;
pub mod error;
pub mod features;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod types;

pub use config::ServiceConfig;
pub use error::{ScoringError, ServiceError};
pub use pipeline::Pipeline;
pub use types::{Reading, ScoreResult};

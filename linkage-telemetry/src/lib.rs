//! Tracing setup for linkage pipelines.
//!
//! This crate provides:
//! - Subscriber initialisation (human-readable or JSON) driven by `RUST_LOG`
//! - [`StageTimingLayer`], a layer that records how long each pipeline stage took

mod init;
pub mod memory;

pub use init::{init_json, init_telemetry, init_with_timings};
pub use memory::{DEFAULT_STAGE_SPAN, SharedStageTimings, StageTiming, StageTimingLayer};

//! Core helpers shared by every meshconf crate: tracing setup, wall-clock
//! timestamps, real-time pacing and random identifiers.

pub mod id;
pub mod time;
pub mod tracing;

pub use id::{random_id, random_nonzero_id};
pub use time::{FramePacer, Timestamp, elapsed_since, now_timestamp};
pub use tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};

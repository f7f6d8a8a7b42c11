//! meshconf demo participant.
//!
//! This crate provides the `meshconf` command-line program: one participant
//! of a full-mesh conference, driven by lines typed on stdin.

pub mod cli;
pub mod config;
pub mod error;
pub mod session;

pub use cli::Cli;
pub use error::{CliError, CliResult};

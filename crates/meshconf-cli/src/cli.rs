//! Command-line interface definition.

use std::path::PathBuf;

use clap::Parser;

/// meshconf - chat in a peer-to-peer full-mesh conference
#[derive(Debug, Parser)]
#[command(name = "meshconf")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "MESHCONF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Endpoint to listen on (`host:port` or `file://path`)
    #[arg(long, short, env = "MESHCONF_LISTEN")]
    pub listen: Option<String>,

    /// Display name
    #[arg(long, short, env = "MESHCONF_NAME")]
    pub name: Option<String>,

    /// Invite the participant listening on this endpoint (can be repeated)
    #[arg(long, short, action = clap::ArgAction::Append)]
    pub invite: Vec<String>,

    /// Decline every invitation
    #[arg(long)]
    pub reject_invites: bool,

    /// Seconds a disconnected peer may take to reenter
    #[arg(long)]
    pub grace: Option<u64>,
}

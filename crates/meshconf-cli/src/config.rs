//! CLI configuration.
//!
//! Settings live in an optional `config.toml` at
//! `~/.config/meshconf/config.toml` by default. Command-line flags win over
//! the file.
//!
//! ```toml
//! name = "alice"
//! listen = "file:///tmp/alice.sock"
//! invite = ["file:///tmp/bob.sock"]
//!
//! [timeouts]
//! grace_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshconf_engine::ContextConfig;
use meshconf_protocol::Endpoint;

use crate::cli::Cli;
use crate::error::{CliError, CliResult};

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Debug mode.
    pub debug: bool,

    /// Display name.
    pub name: Option<String>,

    /// Listen endpoint.
    pub listen: Option<String>,

    /// Endpoints to invite at startup.
    pub invite: Vec<String>,

    /// Decline every invitation.
    pub reject_invites: bool,

    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Timeouts, in the units their names say.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub grace_secs: Option<u64>,
    pub handshake_secs: Option<u64>,
    pub io_secs: Option<u64>,
    pub poll_ms: Option<u64>,
}

impl FileConfig {
    /// Loads the default file, or defaults if it does not exist.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CliError::config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| CliError::config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshconf")
    }
}

/// Everything the program needs, flags and file merged.
#[derive(Debug, Clone)]
pub struct Settings {
    pub context: ContextConfig,
    pub invites: Vec<Endpoint>,
    pub reject_invites: bool,
    pub debug: bool,
}

impl Settings {
    pub fn resolve(cli: &Cli, file: FileConfig) -> CliResult<Self> {
        let listen = match cli.listen.as_deref().or(file.listen.as_deref()) {
            Some(text) => text.parse()?,
            None => Endpoint::default(),
        };

        let mut context = ContextConfig::new(listen);
        if let Some(name) = cli.name.clone().or(file.name) {
            context = context.with_display_name(name);
        }
        if let Some(secs) = cli.grace.or(file.timeouts.grace_secs) {
            context = context.with_reconnect_grace(Duration::from_secs(secs));
        }
        if let Some(secs) = file.timeouts.handshake_secs {
            context = context.with_handshake_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = file.timeouts.io_secs {
            context = context.with_io_timeout(Duration::from_secs(secs));
        }
        if let Some(ms) = file.timeouts.poll_ms {
            context = context.with_poll_interval(Duration::from_millis(ms));
        }
        context.validate()?;

        let invites = if cli.invite.is_empty() {
            &file.invite
        } else {
            &cli.invite
        };
        let invites = invites
            .iter()
            .map(|text| text.parse::<Endpoint>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            context,
            invites,
            reject_invites: cli.reject_invites || file.reject_invites,
            debug: cli.debug || file.debug,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_file() {
        let config: FileConfig = toml::from_str(
            r#"
            name = "alice"
            listen = "file:///tmp/alice.sock"
            invite = ["127.0.0.1:11236"]

            [timeouts]
            grace_secs = 30
            poll_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.name.as_deref(), Some("alice"));
        assert_eq!(config.invite, vec!["127.0.0.1:11236"]);
        assert_eq!(config.timeouts.grace_secs, Some(30));
        assert_eq!(config.timeouts.poll_ms, Some(50));
        assert!(!config.reject_invites);
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "name = [").unwrap();
        assert!(matches!(FileConfig::load_from(&path), Err(CliError::Config(_))));
    }

    #[test]
    fn flags_win_over_file() {
        let cli = Cli::parse_from(["meshconf", "--name", "bob", "--invite", "file:///tmp/c.sock"]);
        let file = FileConfig {
            name: Some("alice".into()),
            listen: Some("file:///tmp/alice.sock".into()),
            invite: vec!["127.0.0.1:1".into()],
            timeouts: TimeoutSettings {
                grace_secs: Some(3),
                ..Default::default()
            },
            ..Default::default()
        };
        let settings = Settings::resolve(&cli, file).unwrap();
        assert_eq!(settings.context.display_name, "bob");
        assert_eq!(
            settings.context.listen_endpoint.to_string(),
            "file:///tmp/alice.sock"
        );
        assert_eq!(settings.context.reconnect_grace, Duration::from_secs(3));
        insta::assert_debug_snapshot!(
            settings.invites.iter().map(ToString::to_string).collect::<Vec<_>>(),
            @r#"
        [
            "file:///tmp/c.sock",
        ]
        "#
        );
    }

    #[test]
    fn defaults_without_file() {
        let cli = Cli::parse_from(["meshconf"]);
        let settings = Settings::resolve(&cli, FileConfig::default()).unwrap();
        assert_eq!(settings.context.listen_endpoint.to_string(), "127.0.0.1:11235");
        assert_eq!(settings.context.display_name, "user0");
        assert!(settings.invites.is_empty());
    }

    #[test]
    fn bad_endpoint_is_reported() {
        let cli = Cli::parse_from(["meshconf", "--listen", "nowhere"]);
        assert!(matches!(
            Settings::resolve(&cli, FileConfig::default()),
            Err(CliError::Endpoint(_))
        ));
    }
}

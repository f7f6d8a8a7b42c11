//! Conference configuration.

use std::time::Duration;

use meshconf_protocol::{DEFAULT_PARTICIPANT_NAME, Endpoint, MAX_NAME_LEN, Role};

use crate::error::{EngineResult, Error};

/// Configuration of one local participant and its conference engine.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Where to listen for invitations and reconnections.
    pub listen_endpoint: Endpoint,

    /// Display name announced to peers.
    pub display_name: String,

    /// Role announced to peers.
    pub role: Role,

    /// Timeout of one accept attempt in the listener loop.
    pub accept_timeout: Duration,

    /// Timeout of one wait-for-any in the dispatch loop.
    pub poll_interval: Duration,

    /// How long an inviter waits for the accept or reject decision.
    pub handshake_timeout: Duration,

    /// Read/write timeout on established links and connect timeout.
    pub io_timeout: Duration,

    /// How long a hung-up participant may come back through reenter.
    pub reconnect_grace: Duration,

    /// Whether to remove a dead local-socket file before binding.
    pub cleanup_stale_socket: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            listen_endpoint: Endpoint::default(),
            display_name: DEFAULT_PARTICIPANT_NAME.to_string(),
            role: Role::Client,
            accept_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(200),
            handshake_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(5),
            reconnect_grace: Duration::from_secs(10),
            cleanup_stale_socket: true,
        }
    }
}

impl ContextConfig {
    /// Creates a configuration listening on `listen_endpoint`.
    pub fn new(listen_endpoint: Endpoint) -> Self {
        Self {
            listen_endpoint,
            ..Default::default()
        }
    }

    /// Builder: set display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Builder: set role.
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Builder: set accept timeout.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Builder: set dispatch poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder: set handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Builder: set IO timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Builder: set reconnection grace window.
    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Builder: set cleanup stale socket.
    pub fn with_cleanup_stale_socket(mut self, cleanup: bool) -> Self {
        self.cleanup_stale_socket = cleanup;
        self
    }

    /// Checks values that would otherwise fail deep inside the engine.
    pub fn validate(&self) -> EngineResult<()> {
        validate_name(&self.display_name)?;
        for (what, value) in [
            ("accept_timeout", self.accept_timeout),
            ("poll_interval", self.poll_interval),
            ("handshake_timeout", self.handshake_timeout),
            ("io_timeout", self.io_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::invalid_argument(format!("{what} must not be zero")));
            }
        }
        Ok(())
    }
}

/// A display name must fit the wire format.
pub(crate) fn validate_name(name: &str) -> EngineResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "display name is {} bytes long (max: {MAX_NAME_LEN})",
            name.len()
        )));
    }
    if name.contains('\0') {
        return Err(Error::invalid_argument("display name contains a NUL byte"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ContextConfig::default();
        assert_eq!(config.listen_endpoint.to_string(), "127.0.0.1:11235");
        assert_eq!(config.display_name, "user0");
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.accept_timeout, Duration::from_millis(500));
        assert_eq!(config.reconnect_grace, Duration::from_secs(10));
        assert!(config.cleanup_stale_socket);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_config() {
        let config = ContextConfig::new(Endpoint::local("/tmp/x.sock"))
            .with_display_name("alice")
            .with_role(Role::Transmitter)
            .with_poll_interval(Duration::from_millis(20))
            .with_reconnect_grace(Duration::from_secs(1))
            .with_cleanup_stale_socket(false);

        assert!(config.listen_endpoint.is_local());
        assert_eq!(config.display_name, "alice");
        assert_eq!(config.role, Role::Transmitter);
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.reconnect_grace, Duration::from_secs(1));
        assert!(!config.cleanup_stale_socket);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let long = ContextConfig::default().with_display_name("x".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(long.validate(), Err(Error::InvalidArgument(_))));

        let zero = ContextConfig::default().with_poll_interval(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(Error::InvalidArgument(_))));

        assert!(validate_name("a\0b").is_err());
        assert!(validate_name(&"y".repeat(MAX_NAME_LEN)).is_ok());
    }
}

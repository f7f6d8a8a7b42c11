//! Participant roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// What a participant does in the conference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Regular participant producing and consuming media.
    #[default]
    Client,
    /// Only publishes media.
    Transmitter,
    /// Re-encodes media for other participants.
    Transcoder,
}

impl Role {
    /// Wire representation.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Client => 0,
            Self::Transmitter => 1,
            Self::Transcoder => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Transmitter => "transmitter",
            Self::Transcoder => "transcoder",
        }
    }
}

impl TryFrom<u32> for Role {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Client),
            1 => Ok(Self::Transmitter),
            2 => Ok(Self::Transcoder),
            other => Err(ProtocolError::malformed(format!("unknown role {other}"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "transmitter" => Ok(Self::Transmitter),
            "transcoder" => Ok(Self::Transcoder),
            _ => Err(ProtocolError::invalid_argument(format!("unknown role '{s}'"))),
        }
    }
}

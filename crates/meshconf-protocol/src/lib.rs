//! Wire protocol for meshconf conferences.
//!
//! Participants talk to each other over plain byte streams (TCP or local
//! sockets). Every message is self-delimiting:
//!
//! ```text
//! +-------------------+----------------+------------------------+
//! | total size (8 LE) |  type tag (4)  |  type-specific fields  |
//! +-------------------+----------------+------------------------+
//! ```
//!
//! `total size` counts the whole frame including itself and the tag.
//!
//! # Example
//!
//! ```rust
//! use meshconf_protocol::{Message, Reenter};
//!
//! let message = Message::Reenter(Reenter { conf_id: 7, part_id: 42 });
//! let bytes = message.encode().unwrap();
//! assert_eq!(Message::decode(&bytes).unwrap(), message);
//! ```

mod endpoint;
mod error;
mod framing;
mod message;
mod role;
mod wire;

pub use endpoint::Endpoint;
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter};
pub use message::{
    Invite, InviteAccept, MediaPayload, Message, MessageType, PartInfo, PartPresence,
    PresenceState, Reenter, Text,
};
pub use role::Role;

pub use meshconf_core::Timestamp;

/// Random identifier of one participant within a conference.
pub type ParticipantId = u64;

/// Random identifier of one conference instance.
pub type ConferenceId = u64;

/// Size of the fixed frame header: total size (8) and type tag (4).
pub const HEADER_SIZE: usize = 12;

/// Largest frame a peer may announce (16 MiB).
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Longest display name, in bytes, excluding the terminating NUL.
pub const MAX_NAME_LEN: usize = 64;

/// Loopback address participants listen on unless told otherwise.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1";

/// Port participants listen on unless told otherwise.
pub const DEFAULT_LISTEN_PORT: u16 = 11235;

/// Display name given to a participant that did not pick one.
pub const DEFAULT_PARTICIPANT_NAME: &str = "user0";

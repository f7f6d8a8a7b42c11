//! Wire messages exchanged between participants.
//!
//! Field layouts after the 12-byte header (all integers little-endian):
//!
//! | type | fields |
//! | --- | --- |
//! | Invite | conf_id u64, conf_start_ts u64, part_id u64, role u32, endpoint, name\0 |
//! | InviteAccept | part_id u64, role u32, endpoint, name\0 |
//! | InviteReject | - |
//! | PartPresence | part_id u64, endpoint, role u32, state u32 |
//! | PartInfo | part_id u64, role u32, name\0 |
//! | Reenter | conf_id u64, part_id u64 |
//! | ReenterConfirm | - |
//! | Text | part_id u64, text\0 |
//! | Audio, Video | part_id u64, packet bytes |

use bytes::{BufMut, Bytes, BytesMut};

use crate::endpoint::Endpoint;
use crate::error::{ProtocolError, ProtocolResult};
use crate::role::Role;
use crate::wire;
use crate::{ConferenceId, HEADER_SIZE, MAX_MESSAGE_SIZE, MAX_NAME_LEN, ParticipantId, Timestamp};

/// Type tag carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Invite = 0,
    InviteAccept = 1,
    InviteReject = 2,
    PartPresence = 3,
    PartInfo = 4,
    Reenter = 5,
    ReenterConfirm = 6,
    Text = 8,
    Audio = 9,
    Video = 10,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => Self::Invite,
            1 => Self::InviteAccept,
            2 => Self::InviteReject,
            3 => Self::PartPresence,
            4 => Self::PartInfo,
            5 => Self::Reenter,
            6 => Self::ReenterConfirm,
            8 => Self::Text,
            9 => Self::Audio,
            10 => Self::Video,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Invitation to join the sender's conference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub conf_id: ConferenceId,
    pub conf_start_ts: Timestamp,
    pub part_id: ParticipantId,
    pub role: Role,
    pub listen_endpoint: Endpoint,
    pub name: String,
}

/// Positive answer to an [`Invite`], describing the accepting participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteAccept {
    pub part_id: ParticipantId,
    pub role: Role,
    pub listen_endpoint: Endpoint,
    pub name: String,
}

/// Whether a presence message announces a join or a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    Join,
    Leave,
}

/// One membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPresence {
    pub part_id: ParticipantId,
    pub endpoint: Endpoint,
    pub role: Role,
    pub state: PresenceState,
}

/// Updated description of a participant (rename, role change).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartInfo {
    pub part_id: ParticipantId,
    pub role: Role,
    pub name: String,
}

/// Request to resume a connection after an accidental disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reenter {
    pub conf_id: ConferenceId,
    pub part_id: ParticipantId,
}

/// Chat line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text {
    pub part_id: ParticipantId,
    pub text: String,
}

/// Encoded media packet from one participant. The packet layout belongs to
/// the codec engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub part_id: ParticipantId,
    pub packet: Bytes,
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Invite(Invite),
    InviteAccept(InviteAccept),
    InviteReject,
    PartPresence(PartPresence),
    PartInfo(PartInfo),
    Reenter(Reenter),
    ReenterConfirm,
    Text(Text),
    Audio(MediaPayload),
    Video(MediaPayload),
}

fn check_name(name: &str) -> ProtocolResult<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::invalid_argument(format!(
            "name is {} bytes long (max: {MAX_NAME_LEN})",
            name.len()
        )));
    }
    Ok(())
}

fn decode_name(buf: &mut &[u8]) -> ProtocolResult<String> {
    let name = wire::get_trailing_str(buf, "name")?;
    if name.len() > MAX_NAME_LEN {
        return Err(ProtocolError::malformed(format!(
            "name is {} bytes long",
            name.len()
        )));
    }
    Ok(name)
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invite(_) => MessageType::Invite,
            Self::InviteAccept(_) => MessageType::InviteAccept,
            Self::InviteReject => MessageType::InviteReject,
            Self::PartPresence(_) => MessageType::PartPresence,
            Self::PartInfo(_) => MessageType::PartInfo,
            Self::Reenter(_) => MessageType::Reenter,
            Self::ReenterConfirm => MessageType::ReenterConfirm,
            Self::Text(_) => MessageType::Text,
            Self::Audio(_) => MessageType::Audio,
            Self::Video(_) => MessageType::Video,
        }
    }

    /// Serialises the message into one complete frame.
    ///
    /// # Errors
    ///
    /// Fails if a name is too long, a string contains a NUL byte, or the
    /// frame would exceed [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        buf.put_u64_le(0);
        buf.put_u32_le(self.message_type() as u32);

        match self {
            Self::Invite(invite) => {
                check_name(&invite.name)?;
                buf.put_u64_le(invite.conf_id);
                buf.put_u64_le(invite.conf_start_ts);
                buf.put_u64_le(invite.part_id);
                buf.put_u32_le(invite.role.as_u32());
                invite.listen_endpoint.encode(&mut buf)?;
                wire::put_trailing_str(&mut buf, &invite.name, "name")?;
            }
            Self::InviteAccept(accept) => {
                check_name(&accept.name)?;
                buf.put_u64_le(accept.part_id);
                buf.put_u32_le(accept.role.as_u32());
                accept.listen_endpoint.encode(&mut buf)?;
                wire::put_trailing_str(&mut buf, &accept.name, "name")?;
            }
            Self::PartPresence(presence) => {
                buf.put_u64_le(presence.part_id);
                presence.endpoint.encode(&mut buf)?;
                buf.put_u32_le(presence.role.as_u32());
                buf.put_u32_le(match presence.state {
                    PresenceState::Join => 0,
                    PresenceState::Leave => 1,
                });
            }
            Self::PartInfo(info) => {
                check_name(&info.name)?;
                buf.put_u64_le(info.part_id);
                buf.put_u32_le(info.role.as_u32());
                wire::put_trailing_str(&mut buf, &info.name, "name")?;
            }
            Self::Reenter(reenter) => {
                buf.put_u64_le(reenter.conf_id);
                buf.put_u64_le(reenter.part_id);
            }
            Self::Text(text) => {
                buf.put_u64_le(text.part_id);
                wire::put_trailing_str(&mut buf, &text.text, "text")?;
            }
            Self::Audio(media) | Self::Video(media) => {
                buf.put_u64_le(media.part_id);
                buf.put_slice(&media.packet);
            }
            Self::InviteReject | Self::ReenterConfirm => {}
        }

        let size = buf.len() as u64;
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        buf[..8].copy_from_slice(&size.to_le_bytes());
        Ok(buf.freeze())
    }

    /// Parses one complete frame, header included.
    ///
    /// # Errors
    ///
    /// Fails if the declared size differs from `frame.len()`, the tag is
    /// unknown, or the body does not match its type's layout exactly.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        let mut buf = frame;
        let size = wire::get_u64(&mut buf, "size").map_err(|_| ProtocolError::IncompleteMessage {
            expected: HEADER_SIZE,
            received: frame.len(),
        })?;
        if size < HEADER_SIZE as u64 {
            return Err(ProtocolError::EmptyMessage);
        }
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        if size != frame.len() as u64 {
            return Err(ProtocolError::malformed(format!(
                "declared size {size} but frame is {} bytes",
                frame.len()
            )));
        }
        let tag = wire::get_u32(&mut buf, "type tag")?;
        let message_type = MessageType::try_from(tag)?;
        let buf = &mut buf;

        let message = match message_type {
            MessageType::Invite => {
                let conf_id = wire::get_u64(buf, "conf_id")?;
                let conf_start_ts = wire::get_u64(buf, "conf_start_ts")?;
                let part_id = wire::get_u64(buf, "part_id")?;
                let role = Role::try_from(wire::get_u32(buf, "role")?)?;
                let listen_endpoint = Endpoint::decode(buf)?;
                let name = decode_name(buf)?;
                Self::Invite(Invite {
                    conf_id,
                    conf_start_ts,
                    part_id,
                    role,
                    listen_endpoint,
                    name,
                })
            }
            MessageType::InviteAccept => {
                let part_id = wire::get_u64(buf, "part_id")?;
                let role = Role::try_from(wire::get_u32(buf, "role")?)?;
                let listen_endpoint = Endpoint::decode(buf)?;
                let name = decode_name(buf)?;
                Self::InviteAccept(InviteAccept {
                    part_id,
                    role,
                    listen_endpoint,
                    name,
                })
            }
            MessageType::InviteReject => Self::InviteReject,
            MessageType::PartPresence => {
                let part_id = wire::get_u64(buf, "part_id")?;
                let endpoint = Endpoint::decode(buf)?;
                let role = Role::try_from(wire::get_u32(buf, "role")?)?;
                let state = match wire::get_u32(buf, "presence state")? {
                    0 => PresenceState::Join,
                    1 => PresenceState::Leave,
                    other => {
                        return Err(ProtocolError::malformed(format!(
                            "unknown presence state {other}"
                        )));
                    }
                };
                Self::PartPresence(PartPresence {
                    part_id,
                    endpoint,
                    role,
                    state,
                })
            }
            MessageType::PartInfo => {
                let part_id = wire::get_u64(buf, "part_id")?;
                let role = Role::try_from(wire::get_u32(buf, "role")?)?;
                let name = decode_name(buf)?;
                Self::PartInfo(PartInfo {
                    part_id,
                    role,
                    name,
                })
            }
            MessageType::Reenter => Self::Reenter(Reenter {
                conf_id: wire::get_u64(buf, "conf_id")?,
                part_id: wire::get_u64(buf, "part_id")?,
            }),
            MessageType::ReenterConfirm => Self::ReenterConfirm,
            MessageType::Text => Self::Text(Text {
                part_id: wire::get_u64(buf, "part_id")?,
                text: wire::get_trailing_str(buf, "text")?,
            }),
            MessageType::Audio | MessageType::Video => {
                let part_id = wire::get_u64(buf, "part_id")?;
                let packet = Bytes::copy_from_slice(std::mem::take(buf));
                let media = MediaPayload { part_id, packet };
                if message_type == MessageType::Audio {
                    Self::Audio(media)
                } else {
                    Self::Video(media)
                }
            }
        };

        wire::finish(buf, "message body")?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite(name: &str) -> Message {
        Message::Invite(Invite {
            conf_id: u64::MAX,
            conf_start_ts: 1_700_000_000_000_000_000,
            part_id: 42,
            role: Role::Transmitter,
            listen_endpoint: "file:///tmp/alice.sock".parse().unwrap(),
            name: name.to_string(),
        })
    }

    fn every_variant() -> Vec<Message> {
        vec![
            invite("alice"),
            invite(&"n".repeat(MAX_NAME_LEN)),
            Message::InviteAccept(InviteAccept {
                part_id: 7,
                role: Role::Client,
                listen_endpoint: "[::1]:9000".parse().unwrap(),
                name: String::new(),
            }),
            Message::InviteReject,
            Message::PartPresence(PartPresence {
                part_id: 1,
                endpoint: "10.1.2.3:11235".parse().unwrap(),
                role: Role::Transcoder,
                state: PresenceState::Leave,
            }),
            Message::PartInfo(PartInfo {
                part_id: 3,
                role: Role::Client,
                name: "bob".into(),
            }),
            Message::Reenter(Reenter {
                conf_id: 0,
                part_id: u64::MAX,
            }),
            Message::ReenterConfirm,
            Message::Text(Text {
                part_id: 5,
                text: String::new(),
            }),
            Message::Text(Text {
                part_id: 5,
                text: "hello, mesh 👋".into(),
            }),
            Message::Audio(MediaPayload {
                part_id: 9,
                packet: Bytes::from_static(&[1, 2, 3, 4]),
            }),
            Message::Video(MediaPayload {
                part_id: 9,
                packet: Bytes::new(),
            }),
        ]
    }

    #[test]
    fn encode_decode_roundtrip() {
        for message in every_variant() {
            let bytes = message.encode().unwrap();
            let size = u64::from_le_bytes(bytes[..8].try_into().unwrap());
            assert_eq!(size as usize, bytes.len());
            assert_eq!(Message::decode(&bytes).unwrap(), message);
        }
    }

    #[test]
    fn header_layout() {
        let bytes = Message::InviteReject.encode().unwrap();
        assert_eq!(&bytes[..], &[12, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0]);

        let bytes = Message::Reenter(Reenter {
            conf_id: 1,
            part_id: 2,
        })
        .encode()
        .unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 16);
        assert_eq!(&bytes[8..12], &5u32.to_le_bytes());
    }

    #[test]
    fn text_is_nul_terminated() {
        let bytes = Message::Text(Text {
            part_id: 1,
            text: "hi".into(),
        })
        .encode()
        .unwrap();
        assert_eq!(&bytes[HEADER_SIZE + 8..], b"hi\0");
    }

    #[test]
    fn long_name_rejected() {
        let err = invite(&"x".repeat(MAX_NAME_LEN + 1)).encode().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument(_)));
    }

    #[test]
    fn interior_nul_rejected() {
        let message = Message::Text(Text {
            part_id: 1,
            text: "a\0b".into(),
        });
        assert!(matches!(message.encode(), Err(ProtocolError::InvalidArgument(_))));
    }

    #[test]
    fn decode_unknown_tag() {
        let mut frame = Message::ReenterConfirm.encode().unwrap().to_vec();
        frame[8..12].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::UnknownMessageType(7))
        ));
    }

    #[test]
    fn decode_size_mismatch() {
        let mut frame = Message::ReenterConfirm.encode().unwrap().to_vec();
        frame.push(0);
        assert!(matches!(Message::decode(&frame), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn decode_trailing_bytes() {
        let mut frame = Message::Reenter(Reenter {
            conf_id: 1,
            part_id: 2,
        })
        .encode()
        .unwrap()
        .to_vec();
        frame.extend_from_slice(&[0, 0]);
        let size = frame.len() as u64;
        frame[..8].copy_from_slice(&size.to_le_bytes());
        assert!(matches!(Message::decode(&frame), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn decode_truncated_body() {
        let frame = invite("alice").encode().unwrap();
        let mut cut = frame[..frame.len() - 10].to_vec();
        let size = cut.len() as u64;
        cut[..8].copy_from_slice(&size.to_le_bytes());
        assert!(Message::decode(&cut).is_err());
    }

    #[test]
    fn decode_short_header() {
        assert!(matches!(
            Message::decode(&[1, 2, 3]),
            Err(ProtocolError::IncompleteMessage { expected: 12, received: 3 })
        ));
        let mut tiny = 4u64.to_le_bytes().to_vec();
        tiny.extend_from_slice(&[0; 4]);
        assert!(matches!(Message::decode(&tiny), Err(ProtocolError::EmptyMessage)));
    }

    #[test]
    fn decode_bad_role_and_state() {
        let mut frame = Message::PartPresence(PartPresence {
            part_id: 1,
            endpoint: "1.1.1.1:1".parse().unwrap(),
            role: Role::Client,
            state: PresenceState::Join,
        })
        .encode()
        .unwrap()
        .to_vec();
        let len = frame.len();

        let mut bad_role = frame.clone();
        bad_role[len - 8..len - 4].copy_from_slice(&9u32.to_le_bytes());
        insta::assert_snapshot!(
            Message::decode(&bad_role).unwrap_err(),
            @"malformed message: unknown role 9"
        );

        frame[len - 4..].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(Message::decode(&frame), Err(ProtocolError::Malformed(_))));
    }
}

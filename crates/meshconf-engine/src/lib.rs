//! Peer-to-peer full-mesh conference engine.
//!
//! This crate provides everything one participant needs to take part in a
//! meshconf conference:
//! - Transport connections over TCP or local sockets, with a
//!   wait-for-any primitive across many of them
//! - The participant directory, including ghosts awaiting reconnection
//! - Per-participant media streams, each drained by its own worker thread
//! - The invite handshake, presence propagation and hangup/reenter
//! - The [`Conference`] that runs the listener and dispatch threads
//!
//! Media coding and transport security are collaborators behind the
//! [`CodecEngine`] and [`SecureChannel`] traits.

mod codec;
mod conference;
mod config;
mod connection;
mod error;
mod participant;
mod secure;
mod stream;
mod sync;

pub use codec::{
    AudioProfile, CodecEngine, Decoder, EncodedPacket, Encoder, MediaFrame, MediaKind,
    MediaProfiles, PACKET_FLAG_KEY, Profiles, RawCodec, SideData, VideoProfile,
};
pub use conference::{
    Conference, ConferenceBuilder, ConferenceSnapshot, InviteHandler, MediaHandler, SelfSummary,
    TextHandler, accept_any, reject_any,
};
pub use config::ContextConfig;
pub use connection::{Connection, Listener, Ready, Socket, receive_any};
pub use error::{EngineResult, Error};
pub use participant::{Directory, Participant, ParticipantSummary, ResurrectError};
pub use secure::{PlainChannel, SecureChannel, SecureStream};
pub use stream::{
    Direction, FrameSink, PacketSink, Stream, StreamContainer, StreamEnv, StreamId, StreamSummary,
};

//! Conference engine.
//!
//! A [`Conference`] is one participant's view of a full-mesh conference. It
//! owns the listener thread that admits inbound invitations and reenter
//! requests, the dispatch thread that multiplexes every peer link while at
//! least one peer is known, and the stream container.
//!
//! ```no_run
//! use meshconf_engine::{ConferenceBuilder, ContextConfig, accept_any};
//! use meshconf_protocol::Endpoint;
//!
//! # fn main() -> meshconf_engine::EngineResult<()> {
//! let config = ContextConfig::new(Endpoint::local("/tmp/a.sock")).with_display_name("alice");
//! let conference = ConferenceBuilder::new(config)
//!     .on_invite(accept_any)
//!     .on_text(|from, text| println!("{from:016x}: {text}"))
//!     .build()?;
//! conference.init()?;
//! conference.invite(&Endpoint::local("/tmp/b.sock"))?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod handshake;
mod presence;
mod reconnect;


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use meshconf_core::{Timestamp, now_timestamp, random_nonzero_id};
use meshconf_protocol::{
    ConferenceId, Endpoint, Invite, MediaPayload, Message, PartInfo, ParticipantId, Role, Text,
};

use crate::codec::{CodecEngine, EncodedPacket, MediaFrame, MediaKind, RawCodec};
use crate::config::{ContextConfig, validate_name};
use crate::connection::Listener;
use crate::error::{EngineResult, Error};
use crate::participant::{Directory, ParticipantSummary};
use crate::secure::{PlainChannel, SecureChannel};
use crate::stream::{Direction, Stream, StreamContainer, StreamEnv, StreamId, StreamSummary};
use crate::sync::{lock, read, write};

/// Decides whether to join the conference an [`Invite`] comes from.
pub type InviteHandler = Arc<dyn Fn(&Invite) -> bool + Send + Sync>;

/// Receives chat text: `(sender, text)`.
pub type TextHandler = Arc<dyn Fn(ParticipantId, &str) + Send + Sync>;

/// Receives decoded media: `(sender, kind, frame)`.
pub type MediaHandler = Arc<dyn Fn(ParticipantId, MediaKind, MediaFrame) + Send + Sync>;

/// Invite handler that accepts every invitation.
pub fn accept_any(_invite: &Invite) -> bool {
    true
}

/// Invite handler that declines every invitation.
pub fn reject_any(_invite: &Invite) -> bool {
    false
}

/// Builder for [`Conference`].
pub struct ConferenceBuilder {
    config: ContextConfig,
    on_invite: InviteHandler,
    on_text: TextHandler,
    on_media: MediaHandler,
    codec: Arc<dyn CodecEngine>,
    secure: Arc<dyn SecureChannel>,
}

impl ConferenceBuilder {
    /// Starts from `config`. Invitations are declined until
    /// [`ConferenceBuilder::on_invite`] says otherwise.
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            on_invite: Arc::new(reject_any),
            on_text: Arc::new(|_, _| {}),
            on_media: Arc::new(|_, _, _| {}),
            codec: Arc::new(RawCodec::new()),
            secure: Arc::new(PlainChannel),
        }
    }

    pub fn on_invite(mut self, handler: impl Fn(&Invite) -> bool + Send + Sync + 'static) -> Self {
        self.on_invite = Arc::new(handler);
        self
    }

    pub fn on_text(mut self, handler: impl Fn(ParticipantId, &str) + Send + Sync + 'static) -> Self {
        self.on_text = Arc::new(handler);
        self
    }

    pub fn on_media(
        mut self,
        handler: impl Fn(ParticipantId, MediaKind, MediaFrame) + Send + Sync + 'static,
    ) -> Self {
        self.on_media = Arc::new(handler);
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn CodecEngine>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_secure_channel(mut self, secure: Arc<dyn SecureChannel>) -> Self {
        self.secure = secure;
        self
    }

    /// Validates the configuration and builds an uninitialised conference.
    pub fn build(self) -> EngineResult<Conference> {
        self.config.validate()?;
        let Self {
            config,
            on_invite,
            on_text,
            on_media,
            codec,
            secure,
        } = self;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let start_ts = Arc::new(AtomicU64::new(now_timestamp()));
            let env = StreamEnv {
                codec,
                on_frame: on_media,
                on_packet: Arc::new(move |stream: &Stream, packet: EncodedPacket| {
                    if let Some(shared) = weak.upgrade() {
                        shared.broadcast_packet(stream, packet);
                    }
                }),
                start_ts: Arc::clone(&start_ts),
            };
            Shared {
                config,
                session: RwLock::new(None),
                start_ts,
                directory: Directory::new(),
                streams: StreamContainer::new(env),
                membership: Mutex::new(()),
                dispatch: Mutex::new(DispatchState::default()),
                running: AtomicBool::new(false),
                on_invite,
                on_text,
                secure,
            }
        });

        Ok(Conference {
            shared,
            listener: Mutex::new(None),
        })
    }
}

/// Identity of the local participant and the conference it is in.
#[derive(Debug, Clone)]
struct Session {
    conf_id: ConferenceId,
    self_id: ParticipantId,
    role: Role,
    name: String,
    listen_endpoint: Endpoint,
}

#[derive(Default)]
struct DispatchState {
    handle: Option<JoinHandle<()>>,
    running: bool,
}

/// State shared by the application handle and the engine threads.
struct Shared {
    config: ContextConfig,
    session: RwLock<Option<Session>>,
    /// Conference start, shared with the output stream workers.
    start_ts: Arc<AtomicU64>,
    directory: Directory,
    streams: StreamContainer,
    /// Serialises membership commits: conference adoption, directory
    /// additions, leave, hangup and reenter.
    membership: Mutex<()>,
    dispatch: Mutex<DispatchState>,
    running: AtomicBool,
    on_invite: InviteHandler,
    on_text: TextHandler,
    secure: Arc<dyn SecureChannel>,
}

impl Shared {
    fn session(&self) -> EngineResult<Session> {
        read(&self.session).clone().ok_or(Error::EmptyContext)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn start_timestamp(&self) -> Timestamp {
        self.start_ts.load(Ordering::Acquire)
    }

    /// Switches to another conference identity.
    fn adopt(&self, conf_id: ConferenceId, start_ts: Timestamp) {
        if let Some(session) = write(&self.session).as_mut() {
            session.conf_id = conf_id;
        }
        self.start_ts.store(start_ts, Ordering::Release);
    }

    /// Starts a fresh, empty conference.
    fn renew(&self) -> ConferenceId {
        let conf_id = random_nonzero_id();
        self.adopt(conf_id, now_timestamp());
        conf_id
    }

    /// (Re)opens the input audio and video streams of a peer.
    fn open_inputs(&self, id: ParticipantId) -> EngineResult<()> {
        self.streams.close_all(id);
        self.streams.open(id, MediaKind::Audio, Direction::Input)?;
        if let Err(e) = self.streams.open(id, MediaKind::Video, Direction::Input) {
            self.streams.close_all(id);
            return Err(e);
        }
        Ok(())
    }

    /// Sends `message` to every live peer except `except`. Returns how many
    /// peers it reached.
    fn broadcast(&self, message: &Message, except: Option<ParticipantId>) -> usize {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, kind = ?message.message_type(), "Failed to encode broadcast");
                return 0;
            }
        };

        let mut reached = 0;
        for (id, connection) in self.directory.live_connections() {
            if Some(id) == except {
                continue;
            }
            match connection.send_frame(&frame) {
                Ok(()) => reached += 1,
                Err(e) => warn!(
                    participant = %format_args!("{id:016x}"),
                    error = %e,
                    "Failed to send to peer"
                ),
            }
        }
        reached
    }

    fn broadcast_packet(&self, stream: &Stream, packet: EncodedPacket) {
        let Ok(session) = self.session() else {
            return;
        };
        let packet = match packet.to_bytes() {
            Ok(packet) => packet,
            Err(e) => {
                warn!(stream = %stream.id(), error = %e, "Failed to serialise packet");
                return;
            }
        };
        let payload = MediaPayload {
            part_id: session.self_id,
            packet,
        };
        let message = match stream.kind() {
            MediaKind::Audio => Message::Audio(payload),
            MediaKind::Video => Message::Video(payload),
        };
        self.broadcast(&message, None);
    }

    /// Starts the dispatch thread unless it runs already or nobody is
    /// there to talk to.
    fn ensure_dispatch(self: &Arc<Self>) -> EngineResult<()> {
        let mut state = lock(&self.dispatch);
        if state.running || self.directory.is_empty() || !self.is_running() {
            return Ok(());
        }
        if let Some(finished) = state.handle.take() {
            join_unless_current(finished, "dispatch");
        }

        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("meshconf-dispatch".to_string())
            .spawn(move || dispatch::run(&shared))
            .map_err(|e| Error::Threading(e.to_string()))?;
        state.handle = Some(handle);
        state.running = true;
        debug!("Dispatch loop started");
        Ok(())
    }
}

fn join_unless_current(handle: JoinHandle<()>, name: &str) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    if handle.join().is_err() {
        warn!(thread = name, "Engine thread panicked");
    }
}

/// The local participant's identity, as shown in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelfSummary {
    pub id: ParticipantId,
    pub role: Role,
    pub name: String,
}

/// Serialisable view of a whole conference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConferenceSnapshot {
    pub conference_id: ConferenceId,
    pub start_timestamp: Timestamp,
    pub listen_endpoint: Endpoint,
    #[serde(rename = "self")]
    pub local: SelfSummary,
    pub participants: Vec<ParticipantSummary>,
    pub streams: Vec<StreamSummary>,
}

/// One participant's handle on a conference.
///
/// Dropping the handle leaves the conference and stops every engine thread.
pub struct Conference {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Conference {
    /// Binds the listen endpoint, creates the local participant and a new
    /// conference identity, and starts the listener thread.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyInitialized`] on a second call, address and
    /// connection errors from binding, [`Error::Threading`] if the listener
    /// thread cannot be spawned. A failed call leaves the conference
    /// uninitialised.
    pub fn init(&self) -> EngineResult<()> {
        let mut listener_slot = lock(&self.listener);
        let mut session = write(&self.shared.session);
        if session.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let config = &self.shared.config;
        let listener = Listener::bind(&config.listen_endpoint, config.cleanup_stale_socket)
            .inspect_err(|e| {
                error!(endpoint = %config.listen_endpoint, error = %e, "Failed to bind listener");
            })?;
        let listen_endpoint = listener.endpoint().clone();

        *session = Some(Session {
            conf_id: random_nonzero_id(),
            self_id: random_nonzero_id(),
            role: config.role,
            name: config.display_name.clone(),
            listen_endpoint: listen_endpoint.clone(),
        });
        self.shared.start_ts.store(now_timestamp(), Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("meshconf-listener".to_string())
            .spawn(move || dispatch::listen(&shared, listener));
        match spawned {
            Ok(handle) => *listener_slot = Some(handle),
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                *session = None;
                return Err(Error::Threading(e.to_string()));
            }
        }

        info!(endpoint = %listen_endpoint, name = %config.display_name, "Listening for invitations");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        read(&self.shared.session).is_some()
    }

    /// Invites the participant listening on `endpoint` into this
    /// conference and returns its id once it accepted.
    ///
    /// # Errors
    ///
    /// [`Error::InviteRejected`] if the invitee declined, which includes an
    /// invitee already connected to us (e.g. one that invited us first),
    /// [`Error::UnexpectedMessageType`] for any other reply,
    /// [`Error::ConnectionHangup`] if it hung up instead of answering,
    /// [`Error::InvalidArgument`] for the local listen endpoint. The
    /// conference is left unchanged on failure.
    pub fn invite(&self, endpoint: &Endpoint) -> EngineResult<ParticipantId> {
        handshake::invite(&self.shared, endpoint)
    }

    /// Tells every peer we leave, drops every peer and starts a fresh empty
    /// conference with a new id.
    pub fn leave_conference(&self) -> EngineResult<()> {
        presence::leave_conference(&self.shared)
    }

    /// Drops every peer link as if the network went away. Peers are kept as
    /// ghosts until [`Conference::reenter`] or the grace window runs out.
    pub fn hangup(&self) -> EngineResult<()> {
        reconnect::hangup(&self.shared)
    }

    /// Reconnects to every known peer.
    ///
    /// All or nothing: if one peer refuses, the conference is left and the
    /// error returned.
    pub fn reenter(&self) -> EngineResult<()> {
        reconnect::reenter(&self.shared)
    }

    /// Renames the local participant and tells every peer.
    pub fn set_display_name(&self, name: &str) -> EngineResult<()> {
        validate_name(name)?;
        let (self_id, role) = {
            let mut session = write(&self.shared.session);
            let session = session.as_mut().ok_or(Error::EmptyContext)?;
            session.name = name.to_string();
            (session.self_id, session.role)
        };
        let reached = self.shared.broadcast(
            &Message::PartInfo(PartInfo {
                part_id: self_id,
                role,
                name: name.to_string(),
            }),
            None,
        );
        info!(name, peers = reached, "Display name changed");
        Ok(())
    }

    /// Sends chat text to every live peer. Returns how many were reached.
    pub fn send_text(&self, text: &str) -> EngineResult<usize> {
        let session = self.shared.session()?;
        if text.contains('\0') {
            return Err(Error::invalid_argument("text contains a NUL byte"));
        }
        Ok(self.shared.broadcast(
            &Message::Text(Text {
                part_id: session.self_id,
                text: text.to_string(),
            }),
            None,
        ))
    }

    /// Opens a local output stream. Frames pushed to it are encoded and
    /// sent to every peer.
    pub fn open_output(&self, kind: MediaKind) -> EngineResult<StreamId> {
        let session = self.shared.session()?;
        let stream = self
            .shared
            .streams
            .open(session.self_id, kind, Direction::Output)?;
        Ok(stream.id())
    }

    /// Queues a raw frame on an output stream.
    pub fn push_frame(&self, stream: StreamId, frame: MediaFrame) -> EngineResult<()> {
        self.shared.session()?;
        self.shared.streams.push_frame(stream, frame)
    }

    pub fn close_stream(&self, stream: StreamId) -> EngineResult<()> {
        self.shared.streams.close(stream)
    }

    pub fn conference_id(&self) -> EngineResult<ConferenceId> {
        Ok(self.shared.session()?.conf_id)
    }

    pub fn self_id(&self) -> EngineResult<ParticipantId> {
        Ok(self.shared.session()?.self_id)
    }

    /// Conference start in nanoseconds since the epoch.
    pub fn start_timestamp(&self) -> EngineResult<Timestamp> {
        self.shared.session()?;
        Ok(self.shared.start_timestamp())
    }

    /// Listen endpoint actually bound (with the real port for port 0).
    pub fn listen_endpoint(&self) -> EngineResult<Endpoint> {
        Ok(self.shared.session()?.listen_endpoint)
    }

    /// Participants in the conference, the local one included.
    pub fn participant_count(&self) -> usize {
        self.shared.directory.len() + 1
    }

    /// Ids of the remote participants, ghosts included.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.shared.directory.ids()
    }

    pub fn participant(&self, id: ParticipantId) -> Option<ParticipantSummary> {
        self.shared.directory.summary(id)
    }

    /// Whether the dispatch thread is running.
    pub fn is_dispatching(&self) -> bool {
        lock(&self.shared.dispatch).running
    }

    pub fn snapshot(&self) -> EngineResult<ConferenceSnapshot> {
        let session = self.shared.session()?;
        Ok(ConferenceSnapshot {
            conference_id: session.conf_id,
            start_timestamp: self.shared.start_timestamp(),
            listen_endpoint: session.listen_endpoint,
            local: SelfSummary {
                id: session.self_id,
                role: session.role,
                name: session.name,
            },
            participants: self.shared.directory.summaries(),
            streams: self.shared.streams.snapshot(),
        })
    }

    /// Leaves the conference and stops every thread. The conference may be
    /// initialised again afterwards.
    pub fn shutdown(&self) {
        if !self.is_initialized() {
            return;
        }
        if let Err(e) = self.leave_conference() {
            debug!(error = %e, "Leave during shutdown failed");
        }
        self.shared.running.store(false, Ordering::Release);

        if let Some(handle) = lock(&self.listener).take() {
            join_unless_current(handle, "listener");
        }
        let dispatch = lock(&self.shared.dispatch).handle.take();
        if let Some(handle) = dispatch {
            join_unless_current(handle, "dispatch");
        }
        lock(&self.shared.dispatch).running = false;

        self.shared.streams.close_everything();
        *write(&self.shared.session) = None;
        info!("Conference shut down");
    }
}

impl Drop for Conference {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir, name: &str) -> ContextConfig {
        ContextConfig::new(Endpoint::local(dir.path().join(format!("{name}.sock"))))
            .with_display_name(name)
            .with_accept_timeout(Duration::from_millis(50))
            .with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn operations_need_init() {
        let dir = tempfile::tempdir().unwrap();
        let conference = ConferenceBuilder::new(config(&dir, "a")).build().unwrap();
        assert!(!conference.is_initialized());
        assert!(matches!(conference.conference_id(), Err(Error::EmptyContext)));
        assert!(matches!(conference.send_text("hi"), Err(Error::EmptyContext)));
        assert!(matches!(
            conference.open_output(MediaKind::Audio),
            Err(Error::EmptyContext)
        ));
        assert!(matches!(conference.snapshot(), Err(Error::EmptyContext)));
        assert_eq!(conference.participant_count(), 1);
    }

    #[test]
    fn init_twice_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conference = ConferenceBuilder::new(config(&dir, "a")).build().unwrap();
        conference.init().unwrap();
        assert!(matches!(conference.init(), Err(Error::AlreadyInitialized)));
        assert!(conference.is_initialized());
    }

    #[test]
    fn build_validates_config() {
        let dir = tempfile::tempdir().unwrap();
        let bad = config(&dir, "a").with_display_name("x".repeat(200));
        assert!(matches!(
            ConferenceBuilder::new(bad).build(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn bind_failure_leaves_conference_uninitialised() {
        let conference = ConferenceBuilder::new(ContextConfig::new(Endpoint::local(
            "/nonexistent-meshconf-dir/a.sock",
        )))
        .build()
        .unwrap();
        assert!(conference.init().is_err());
        assert!(!conference.is_initialized());
    }

    #[test]
    fn refuses_to_invite_itself() {
        let dir = tempfile::tempdir().unwrap();
        let conference = ConferenceBuilder::new(config(&dir, "a")).build().unwrap();
        conference.init().unwrap();
        let own = conference.listen_endpoint().unwrap();
        assert!(matches!(
            conference.invite(&own),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(conference.participant_count(), 1);
    }

    #[test]
    fn leave_alone_renews_identity() {
        let dir = tempfile::tempdir().unwrap();
        let conference = ConferenceBuilder::new(config(&dir, "a")).build().unwrap();
        conference.init().unwrap();
        let before = conference.conference_id().unwrap();
        let self_id = conference.self_id().unwrap();
        conference.leave_conference().unwrap();
        assert_ne!(conference.conference_id().unwrap(), before);
        assert_eq!(conference.self_id().unwrap(), self_id);
    }

    #[test]
    fn rename_validates_length() {
        let dir = tempfile::tempdir().unwrap();
        let conference = ConferenceBuilder::new(config(&dir, "a")).build().unwrap();
        conference.init().unwrap();
        assert!(conference.set_display_name(&"n".repeat(65)).is_err());
        conference.set_display_name("alice").unwrap();
        assert_eq!(conference.snapshot().unwrap().local.name, "alice");
    }

    #[test]
    fn shutdown_allows_reinit() {
        let dir = tempfile::tempdir().unwrap();
        let conference = ConferenceBuilder::new(config(&dir, "a")).build().unwrap();
        conference.init().unwrap();
        conference.shutdown();
        assert!(!conference.is_initialized());
        conference.init().unwrap();
        assert!(conference.is_initialized());
    }

    #[test]
    fn snapshot_serialises() {
        let dir = tempfile::tempdir().unwrap();
        let conference = ConferenceBuilder::new(config(&dir, "a")).build().unwrap();
        conference.init().unwrap();
        conference.open_output(MediaKind::Video).unwrap();
        let json = serde_json::to_value(conference.snapshot().unwrap()).unwrap();
        assert_eq!(json["self"]["name"], "a");
        assert_eq!(json["participants"].as_array().unwrap().len(), 0);
        assert_eq!(json["streams"][0]["direction"], "output");
        assert!(json["listen_endpoint"].as_str().unwrap().starts_with("file://"));
    }
}

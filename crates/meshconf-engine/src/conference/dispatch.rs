//! Listener and dispatch loops.

use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use meshconf_protocol::{Message, ParticipantId};

use super::{Shared, handshake, presence, reconnect};
use crate::codec::{EncodedPacket, MediaKind};
use crate::connection::{Connection, Listener, Ready, Socket, receive_any};
use crate::error::Error;
use crate::sync::lock;

/// Body of the listener thread: admits inbound links until the conference
/// stops.
pub(super) fn listen(shared: &Arc<Shared>, mut listener: Listener) {
    debug!(endpoint = %listener.endpoint(), "Listener loop started");
    while shared.is_running() {
        match listener.accept(shared.config.accept_timeout) {
            Ok(socket) => admit(shared, socket),
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                warn!(error = %e, "Accept failed");
                thread::sleep(shared.config.poll_interval);
            }
        }
    }
    debug!("Listener loop stopped");
}

/// Reads the first message of an inbound link and runs the matching
/// protocol. A failure only costs that link.
fn admit(shared: &Arc<Shared>, socket: Socket) {
    let connection = match Connection::accept(socket, shared.config.io_timeout, &*shared.secure) {
        Ok(connection) => Arc::new(connection),
        Err(e) => {
            warn!(error = %e, "Failed to set up inbound link");
            return;
        }
    };

    let result = match connection.receive() {
        Ok(Message::Invite(invite)) => handshake::answer_invite(shared, &connection, invite),
        Ok(Message::Reenter(reenter)) => reconnect::answer_reenter(shared, &connection, reenter),
        Ok(other) => Err(Error::UnexpectedMessageType(other.message_type())),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(peer = %connection.peer(), error = %e, "Dropping inbound link");
        connection.close();
    }
}

/// Body of the dispatch thread: waits on every live peer link and routes
/// what arrives until no peer is left.
pub(super) fn run(shared: &Arc<Shared>) {
    let config = &shared.config;
    let mut epoch = None;
    let mut peers: Vec<ParticipantId> = Vec::new();
    let mut links: Vec<Option<Arc<Connection>>> = Vec::new();

    loop {
        if should_stop(shared) {
            break;
        }

        let current = shared.directory.epoch();
        if epoch != Some(current) {
            epoch = Some(current);
            (peers, links) = shared
                .directory
                .live_connections()
                .into_iter()
                .map(|(id, connection)| (id, Some(connection)))
                .unzip();
            debug!(links = links.len(), epoch = current, "Refreshed peer links");
        }

        if shared.directory.ghost_count() > 0 {
            for gone in shared.directory.sweep_expired(config.reconnect_grace) {
                shared.streams.close_all(gone.id);
                info!(
                    participant = %format_args!("{:016x}", gone.id),
                    name = %gone.name,
                    "Participant did not come back"
                );
            }
        }

        match receive_any(&links, config.poll_interval) {
            Ok(Ready::Timeout) => {}
            Ok(Ready::Message { index, message }) => route(shared, peers[index], message),
            Ok(Ready::Hangup { index }) => {
                if let Some(connection) = links[index].take() {
                    peer_lost(shared, peers[index], &connection);
                }
            }
            Ok(Ready::Failed { index, error }) => {
                warn!(
                    participant = %format_args!("{:016x}", peers[index]),
                    error = %error,
                    "Peer link failed"
                );
                if let Some(connection) = links[index].take() {
                    peer_lost(shared, peers[index], &connection);
                }
            }
            // every known peer is a ghost
            Err(Error::NoValidConnections) => thread::sleep(config.poll_interval),
            Err(e) => {
                warn!(error = %e, "Waiting on peer links failed");
                thread::sleep(config.poll_interval);
            }
        }
    }
    debug!("Dispatch loop stopped");
}

/// Decides under the dispatch lock whether the loop ends, so that a
/// concurrent `ensure_dispatch` either sees the loop running or starts a
/// new one.
fn should_stop(shared: &Shared) -> bool {
    if shared.is_running() && !shared.directory.is_empty() {
        return false;
    }
    let mut state = lock(&shared.dispatch);
    if shared.is_running() && !shared.directory.is_empty() {
        return false;
    }
    state.running = false;
    true
}

fn peer_lost(shared: &Shared, id: ParticipantId, connection: &Arc<Connection>) {
    if shared.directory.mark_hangup(id, connection) {
        shared.streams.close_all(id);
        info!(participant = %format_args!("{id:016x}"), "Participant hung up");
    }
    connection.close();
}

fn route(shared: &Arc<Shared>, from: ParticipantId, message: Message) {
    match message {
        Message::PartPresence(presence) => presence::on_presence(shared, presence),
        Message::PartInfo(info) => {
            if shared.directory.update_info(info.part_id, info.role, &info.name) {
                info!(
                    participant = %format_args!("{:016x}", info.part_id),
                    name = %info.name,
                    "Participant renamed"
                );
            }
        }
        Message::Text(text) => (shared.on_text)(text.part_id, &text.text),
        Message::Audio(payload) => deliver(shared, from, MediaKind::Audio, &payload.packet),
        Message::Video(payload) => deliver(shared, from, MediaKind::Video, &payload.packet),
        other => debug!(
            participant = %format_args!("{from:016x}"),
            kind = ?other.message_type(),
            "Ignoring message out of handshake"
        ),
    }
}

fn deliver(shared: &Shared, from: ParticipantId, kind: MediaKind, blob: &[u8]) {
    let packet = match EncodedPacket::from_bytes(blob) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(participant = %format_args!("{from:016x}"), error = %e, "Dropping malformed packet");
            return;
        }
    };
    if let Err(e) = shared.streams.push_packet(from, kind, packet) {
        warn!(participant = %format_args!("{from:016x}"), %kind, error = %e, "No stream for packet");
    }
}

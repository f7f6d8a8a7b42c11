//! Invite handshake, both sides.
//!
//! ```text
//! inviter                          invitee
//!    | ---------- Invite ----------> |  decision callback
//!    | <--- InviteAccept / Reject -- |
//! ```
//!
//! The link an accepted handshake ran over becomes the peer link of both
//! sides.

use std::sync::Arc;

use tracing::{debug, info};

use meshconf_protocol::{Endpoint, Invite, InviteAccept, Message, ParticipantId};

use super::{Session, Shared, presence};
use crate::connection::Connection;
use crate::error::{EngineResult, Error};
use crate::participant::Participant;
use crate::sync::lock;

/// Inviter side.
///
/// An invitee declines an invite from a participant it already holds a
/// live link to. When two participants invite each other at the same time,
/// the handshake that commits first wins and the other call returns
/// [`Error::InviteRejected`].
pub(super) fn invite(shared: &Arc<Shared>, endpoint: &Endpoint) -> EngineResult<ParticipantId> {
    let session = shared.session()?;
    if *endpoint == session.listen_endpoint {
        return Err(Error::invalid_argument(format!(
            "{endpoint} is our own listen endpoint"
        )));
    }

    let connection = Arc::new(Connection::connect(
        endpoint,
        shared.config.io_timeout,
        &*shared.secure,
    )?);
    let accept = match request(shared, &connection, &session) {
        Ok(accept) => accept,
        Err(e) => {
            connection.close();
            debug!(%endpoint, error = %e, "Invite failed");
            return Err(e);
        }
    };
    let id = accept.part_id;

    let guard = lock(&shared.membership);
    let current = match shared.session() {
        Ok(current) => current,
        Err(e) => {
            connection.close();
            return Err(e);
        }
    };
    if current.conf_id != session.conf_id {
        connection.close();
        return Err(Error::connection("conference changed while inviting"));
    }
    if id == current.self_id || shared.directory.is_live(id) {
        // reached through another path in the meantime
        connection.close();
        debug!(participant = %format_args!("{id:016x}"), "Invitee already connected");
        return Ok(id);
    }
    if let Err(e) = admit(shared, &connection, accept.clone()) {
        connection.close();
        return Err(e);
    }
    drop(guard);

    info!(
        participant = %format_args!("{id:016x}"),
        name = %accept.name,
        %endpoint,
        "Participant joined"
    );
    presence::announce_join(shared, id, &accept);
    shared.ensure_dispatch()?;
    Ok(id)
}

/// Sends our invitation and waits for the decision.
fn request(shared: &Shared, connection: &Connection, session: &Session) -> EngineResult<InviteAccept> {
    connection.send(&Message::Invite(Invite {
        conf_id: session.conf_id,
        conf_start_ts: shared.start_timestamp(),
        part_id: session.self_id,
        role: session.role,
        listen_endpoint: session.listen_endpoint.clone(),
        name: session.name.clone(),
    }))?;

    match connection.receive_timeout(shared.config.handshake_timeout)? {
        Message::InviteAccept(accept) => Ok(accept),
        Message::InviteReject => Err(Error::InviteRejected),
        other => Err(Error::UnexpectedMessageType(other.message_type())),
    }
}

/// Opens the peer's input streams and records it. Undoes the streams if
/// the directory refuses the entry.
fn admit(shared: &Shared, connection: &Arc<Connection>, accept: InviteAccept) -> EngineResult<()> {
    let id = accept.part_id;
    shared.open_inputs(id)?;
    let participant = Participant::connected(
        id,
        accept.role,
        accept.name,
        accept.listen_endpoint,
        Arc::clone(connection),
    );
    if let Err(e) = shared.directory.add(participant) {
        shared.streams.close_all(id);
        return Err(e);
    }
    Ok(())
}

fn decline(connection: &Connection) {
    if let Err(e) = connection.send(&Message::InviteReject) {
        debug!(peer = %connection.peer(), error = %e, "Failed to send reject");
    }
    connection.close();
}

/// Invitee side, run on the listener thread.
pub(super) fn answer_invite(
    shared: &Arc<Shared>,
    connection: &Arc<Connection>,
    invite: Invite,
) -> EngineResult<()> {
    let id = invite.part_id;
    let session = shared.session()?;
    if id == session.self_id || shared.directory.is_live(id) {
        info!(participant = %format_args!("{id:016x}"), "Declining invite from connected participant");
        decline(connection);
        return Ok(());
    }
    if !(shared.on_invite)(&invite) {
        info!(participant = %format_args!("{id:016x}"), name = %invite.name, "Invite declined");
        decline(connection);
        return Ok(());
    }

    let guard = lock(&shared.membership);
    let mut session = shared.session()?;
    if shared.directory.is_live(id) {
        drop(guard);
        decline(connection);
        return Ok(());
    }
    let mut departed = Vec::new();
    if session.conf_id != invite.conf_id {
        departed = presence::detach(shared);
        shared.adopt(invite.conf_id, invite.conf_start_ts);
        session.conf_id = invite.conf_id;
        info!(
            conference = %format_args!("{:016x}", invite.conf_id),
            inviter = %invite.name,
            "Joined conference"
        );
    }
    let opened = shared.open_inputs(id);
    drop(guard);
    presence::farewell(&session, departed);
    opened?;

    // reply before broadcasts can reach the newcomer
    let accept = Message::InviteAccept(InviteAccept {
        part_id: session.self_id,
        role: session.role,
        listen_endpoint: session.listen_endpoint.clone(),
        name: session.name.clone(),
    });
    if let Err(e) = connection.send(&accept) {
        shared.streams.close_all(id);
        return Err(e);
    }

    let committed = {
        let _guard = lock(&shared.membership);
        match shared.session() {
            Ok(current) if current.conf_id == session.conf_id => shared
                .directory
                .add(Participant::connected(
                    id,
                    invite.role,
                    invite.name.clone(),
                    invite.listen_endpoint.clone(),
                    Arc::clone(connection),
                ))
                .map(drop),
            Ok(_) => Err(Error::connection("conference changed while answering an invite")),
            Err(e) => Err(e),
        }
    };
    if let Err(e) = committed {
        shared.streams.close_all(id);
        return Err(e);
    }

    info!(
        participant = %format_args!("{id:016x}"),
        name = %invite.name,
        endpoint = %invite.listen_endpoint,
        "Participant joined"
    );
    shared.ensure_dispatch()
}

//! Hangup and reenter.
//!
//! A peer whose link drops stays in the directory as a ghost for the grace
//! window. Within it the peer may reconnect with a `Reenter` carrying the
//! conference id; the receiver attaches the new link to the ghost and
//! answers `ReenterConfirm`. A live entry is never taken over.

use std::sync::Arc;

use tracing::{info, warn};

use meshconf_protocol::{Endpoint, Message, ParticipantId, Reenter};

use super::{Session, Shared, presence};
use crate::connection::Connection;
use crate::error::{EngineResult, Error};
use crate::participant::ResurrectError;
use crate::sync::lock;

/// Drops every peer link from our side. Peers become ghosts.
pub(super) fn hangup(shared: &Shared) -> EngineResult<()> {
    shared.session()?;
    let _guard = lock(&shared.membership);
    let detached = shared.directory.hangup_all();
    for (id, connection) in &detached {
        shared.streams.close_all(*id);
        connection.close();
    }
    info!(peers = detached.len(), "Hung up");
    Ok(())
}

/// Reconnects to every known peer, or leaves the conference.
pub(super) fn reenter(shared: &Arc<Shared>) -> EngineResult<()> {
    let session = shared.session()?;
    let targets = shared.directory.endpoints();

    let mut links = Vec::with_capacity(targets.len());
    for (id, endpoint) in &targets {
        match knock(shared, &session, endpoint) {
            Ok(connection) => links.push((*id, connection)),
            Err(e) => {
                warn!(
                    participant = %format_args!("{id:016x}"),
                    %endpoint,
                    error = %e,
                    "Reenter refused, leaving conference"
                );
                return abandon(shared, &links, e);
            }
        }
    }

    let committed = {
        let _guard = lock(&shared.membership);
        links
            .iter()
            .try_for_each(|(id, connection)| reattach(shared, *id, connection))
    };
    if let Err(e) = committed {
        return abandon(shared, &links, e);
    }

    info!(peers = links.len(), "Reentered conference");
    shared.ensure_dispatch()
}

/// Opens a link to one peer and asks to be let back in.
fn knock(shared: &Shared, session: &Session, endpoint: &Endpoint) -> EngineResult<Arc<Connection>> {
    let connection = Arc::new(Connection::connect(
        endpoint,
        shared.config.io_timeout,
        &*shared.secure,
    )?);
    let reply = connection
        .send(&Message::Reenter(Reenter {
            conf_id: session.conf_id,
            part_id: session.self_id,
        }))
        .and_then(|()| connection.receive_timeout(shared.config.handshake_timeout));
    match reply {
        Ok(Message::ReenterConfirm) => Ok(connection),
        Ok(other) => {
            connection.close();
            Err(Error::UnexpectedMessageType(other.message_type()))
        }
        Err(e) => {
            connection.close();
            Err(e)
        }
    }
}

fn reattach(shared: &Shared, id: ParticipantId, connection: &Arc<Connection>) -> EngineResult<()> {
    if let Some(previous) = shared.directory.attach(id, Arc::clone(connection))? {
        previous.close();
    }
    shared.open_inputs(id)
}

fn abandon(
    shared: &Shared,
    links: &[(ParticipantId, Arc<Connection>)],
    error: Error,
) -> EngineResult<()> {
    for (_, connection) in links {
        connection.close();
    }
    presence::leave_conference(shared)?;
    Err(error)
}

/// Receiver side, run on the listener thread.
pub(super) fn answer_reenter(
    shared: &Arc<Shared>,
    connection: &Arc<Connection>,
    reenter: Reenter,
) -> EngineResult<()> {
    let id = reenter.part_id;
    let session = shared.session()?;
    if reenter.conf_id != session.conf_id {
        return Err(Error::invalid_argument(format!(
            "reenter for conference {:016x}",
            reenter.conf_id
        )));
    }

    let grace = shared.config.reconnect_grace;
    let refused = |refusal: ResurrectError| {
        Error::invalid_argument(match refusal {
            ResurrectError::Unknown => format!("unknown participant {id:016x}"),
            ResurrectError::Live => format!("participant {id:016x} is still connected"),
            ResurrectError::Expired => format!("participant {id:016x} came back too late"),
        })
    };
    shared.directory.check_resurrect(id, grace).map_err(refused)?;

    // confirm before broadcasts can reach the reentering peer
    connection.send(&Message::ReenterConfirm)?;

    {
        let _guard = lock(&shared.membership);
        shared
            .directory
            .resurrect(id, Arc::clone(connection), grace)
            .map_err(refused)?;
        if let Err(e) = shared.open_inputs(id) {
            shared.directory.mark_hangup(id, connection);
            return Err(e);
        }
    }

    info!(participant = %format_args!("{id:016x}"), "Participant reentered");
    shared.ensure_dispatch()
}

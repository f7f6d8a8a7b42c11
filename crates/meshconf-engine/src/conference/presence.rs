//! Presence propagation.
//!
//! Whoever admits a new participant tells every other peer about it with a
//! join presence; a peer that does not know the newcomer yet invites it on
//! its own. Leaving is announced the same way and each receiver drops the
//! leaver locally.

use std::sync::Arc;

use tracing::{debug, info, warn};

use meshconf_protocol::{InviteAccept, Message, PartPresence, ParticipantId, PresenceState};

use super::{Session, Shared, handshake};
use crate::error::EngineResult;
use crate::participant::Participant;
use crate::sync::lock;

/// Tells every peer but the newcomer that `id` joined.
pub(super) fn announce_join(shared: &Shared, id: ParticipantId, accept: &InviteAccept) {
    let reached = shared.broadcast(
        &Message::PartPresence(PartPresence {
            part_id: id,
            endpoint: accept.listen_endpoint.clone(),
            role: accept.role,
            state: PresenceState::Join,
        }),
        Some(id),
    );
    debug!(participant = %format_args!("{id:016x}"), peers = reached, "Announced join");
}

/// Handles a presence message on the dispatch thread.
pub(super) fn on_presence(shared: &Arc<Shared>, presence: PartPresence) {
    let id = presence.part_id;
    match presence.state {
        PresenceState::Join => {
            let known = shared
                .session()
                .map(|session| session.self_id == id)
                .unwrap_or(true)
                || shared.directory.contains(id);
            if known {
                return;
            }
            debug!(
                participant = %format_args!("{id:016x}"),
                endpoint = %presence.endpoint,
                "Inviting announced participant"
            );
            if let Err(e) = handshake::invite(shared, &presence.endpoint) {
                warn!(
                    participant = %format_args!("{id:016x}"),
                    endpoint = %presence.endpoint,
                    error = %e,
                    "Failed to invite announced participant"
                );
            }
        }
        PresenceState::Leave => {
            let _guard = lock(&shared.membership);
            let Some(gone) = shared.directory.remove(id) else {
                return;
            };
            shared.streams.close_all(id);
            if let Some(connection) = gone.connection() {
                connection.close();
            }
            info!(participant = %format_args!("{id:016x}"), name = %gone.name, "Participant left");
        }
    }
}

/// Drops every peer and its streams. Runs under the membership lock; the
/// returned participants still hold their links for [`farewell`].
pub(super) fn detach(shared: &Shared) -> Vec<Participant> {
    let dropped = shared.directory.clear();
    for participant in &dropped {
        shared.streams.close_all(participant.id);
    }
    dropped
}

/// Tells detached peers we left and closes their links. Runs outside the
/// membership lock.
pub(super) fn farewell(session: &Session, dropped: Vec<Participant>) {
    let links: Vec<_> = dropped
        .iter()
        .filter_map(|participant| participant.connection().map(|c| (participant.id, c)))
        .collect();
    if links.is_empty() {
        return;
    }

    let leave = Message::PartPresence(PartPresence {
        part_id: session.self_id,
        endpoint: session.listen_endpoint.clone(),
        role: session.role,
        state: PresenceState::Leave,
    });
    let frame = match leave.encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(error = %e, "Failed to encode leave");
            None
        }
    };
    let mut reached = 0;
    for (id, connection) in links {
        if let Some(frame) = &frame {
            match connection.send_frame(frame) {
                Ok(()) => reached += 1,
                Err(e) => debug!(
                    participant = %format_args!("{id:016x}"),
                    error = %e,
                    "Failed to announce leave"
                ),
            }
        }
        connection.close();
    }
    debug!(peers = dropped.len(), reached, "Left peers");
}

pub(super) fn leave_conference(shared: &Shared) -> EngineResult<()> {
    let session = shared.session()?;
    let (dropped, conf_id) = {
        let _guard = lock(&shared.membership);
        (detach(shared), shared.renew())
    };
    farewell(&session, dropped);
    info!(conference = %format_args!("{conf_id:016x}"), "Left conference");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meshconf_protocol::{Endpoint, Role};

    use crate::conference::ConferenceBuilder;
    use crate::config::ContextConfig;

    #[test]
    fn leave_of_unknown_participant_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContextConfig::new(Endpoint::local(dir.path().join("a.sock")))
            .with_accept_timeout(Duration::from_millis(20));
        let conference = ConferenceBuilder::new(config).build().unwrap();
        conference.init().unwrap();
        let conf_id = conference.conference_id().unwrap();
        let epoch = conference.shared.directory.epoch();

        on_presence(
            &conference.shared,
            PartPresence {
                part_id: 0xdead_beef,
                endpoint: Endpoint::local(dir.path().join("ghost.sock")),
                role: Role::Client,
                state: PresenceState::Leave,
            },
        );

        assert_eq!(conference.participant_count(), 1);
        assert_eq!(conference.conference_id().unwrap(), conf_id);
        assert_eq!(conference.shared.directory.epoch(), epoch);
        assert!(conference.snapshot().unwrap().streams.is_empty());
    }
}

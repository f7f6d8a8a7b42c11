//! Participant directory.
//!
//! The directory holds every remote participant known to the local one, in
//! arrival order. An entry without a connection is either not connected yet
//! or a *ghost*: a peer that hung up and may still come back through
//! reenter until its grace window runs out.
//!
//! All methods take the lock for the duration of the call only. Callers get
//! snapshots and perform network I/O after the lock is released.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use meshconf_protocol::{Endpoint, ParticipantId, Role};

use crate::connection::Connection;
use crate::error::{EngineResult, Error};
use crate::sync::{read, write};

/// A remote participant.
#[derive(Debug)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: Role,
    pub name: String,
    pub listen_endpoint: Endpoint,
    connection: Option<Arc<Connection>>,
    hangup_at: Option<Instant>,
}

impl Participant {
    /// A participant reachable over `connection`.
    pub fn connected(
        id: ParticipantId,
        role: Role,
        name: impl Into<String>,
        listen_endpoint: Endpoint,
        connection: Arc<Connection>,
    ) -> Self {
        Self {
            id,
            role,
            name: name.into(),
            listen_endpoint,
            connection: Some(connection),
            hangup_at: None,
        }
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Hung up and waiting for reenter.
    pub fn is_ghost(&self) -> bool {
        self.connection.is_none() && self.hangup_at.is_some()
    }

    /// Time since the hangup, for ghosts.
    pub fn hangup_age(&self) -> Option<Duration> {
        self.hangup_at.map(|at| at.elapsed())
    }

    fn expired(&self, grace: Duration) -> bool {
        self.connection.is_none() && self.hangup_age().is_some_and(|age| age > grace)
    }

    fn resurrectable(&self, grace: Duration) -> Result<(), ResurrectError> {
        if self.is_connected() {
            Err(ResurrectError::Live)
        } else if self.expired(grace) {
            Err(ResurrectError::Expired)
        } else {
            Ok(())
        }
    }

    fn summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            id: self.id,
            role: self.role,
            name: self.name.clone(),
            listen_endpoint: self.listen_endpoint.clone(),
            connected: self.is_connected(),
            hangup_secs: self.hangup_age().map(|age| age.as_secs_f64()),
        }
    }
}

/// Serialisable view of one participant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantSummary {
    pub id: ParticipantId,
    pub role: Role,
    pub name: String,
    pub listen_endpoint: Endpoint,
    pub connected: bool,
    /// Seconds since the participant hung up, for ghosts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hangup_secs: Option<f64>,
}

/// Why a reenter was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResurrectError {
    Unknown,
    /// The entry still has a live connection.
    Live,
    /// The grace window is over.
    Expired,
}

/// Remote participants, guarded by a readers-writer lock.
#[derive(Debug, Default)]
pub struct Directory {
    entries: RwLock<Vec<Participant>>,
    /// Bumped on every mutation.
    epoch: AtomicU64,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Counter that moves whenever membership or connections change.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Number of remote participants, ghosts included.
    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        read(&self.entries).iter().any(|p| p.id == id)
    }

    /// Known and currently connected.
    pub fn is_live(&self, id: ParticipantId) -> bool {
        read(&self.entries)
            .iter()
            .any(|p| p.id == id && p.is_connected())
    }

    pub fn ghost_count(&self) -> usize {
        read(&self.entries).iter().filter(|p| p.is_ghost()).count()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        read(&self.entries).iter().map(|p| p.id).collect()
    }

    pub fn summary(&self, id: ParticipantId) -> Option<ParticipantSummary> {
        read(&self.entries)
            .iter()
            .find(|p| p.id == id)
            .map(Participant::summary)
    }

    pub fn summaries(&self) -> Vec<ParticipantSummary> {
        read(&self.entries).iter().map(Participant::summary).collect()
    }

    /// Connected participants and their connections, in arrival order.
    pub fn live_connections(&self) -> Vec<(ParticipantId, Arc<Connection>)> {
        read(&self.entries)
            .iter()
            .filter_map(|p| p.connection.clone().map(|c| (p.id, c)))
            .collect()
    }

    /// Every participant's id and listen endpoint, connected or not.
    pub fn endpoints(&self) -> Vec<(ParticipantId, Endpoint)> {
        read(&self.entries)
            .iter()
            .map(|p| (p.id, p.listen_endpoint.clone()))
            .collect()
    }

    /// Adds a participant. A ghost with the same id is replaced and
    /// returned; a live one is an error.
    pub fn add(&self, participant: Participant) -> EngineResult<Option<Participant>> {
        let mut entries = write(&self.entries);
        entries.try_reserve(1)?;
        let replaced = match entries.iter().position(|p| p.id == participant.id) {
            Some(index) if entries[index].is_connected() => {
                return Err(Error::invalid_argument(format!(
                    "participant {:016x} is already connected",
                    participant.id
                )));
            }
            Some(index) => Some(entries.remove(index)),
            None => None,
        };
        entries.push(participant);
        drop(entries);
        self.bump();
        Ok(replaced)
    }

    pub fn remove(&self, id: ParticipantId) -> Option<Participant> {
        let mut entries = write(&self.entries);
        let index = entries.iter().position(|p| p.id == id)?;
        let removed = entries.remove(index);
        drop(entries);
        self.bump();
        Some(removed)
    }

    /// Removes everybody.
    pub fn clear(&self) -> Vec<Participant> {
        let removed = std::mem::take(&mut *write(&self.entries));
        self.bump();
        removed
    }

    /// Turns `id` into a ghost if it is still attached to `connection`.
    ///
    /// Returns `false` if the participant is gone or already uses another
    /// connection (e.g. it reentered in the meantime).
    pub fn mark_hangup(&self, id: ParticipantId, connection: &Arc<Connection>) -> bool {
        let mut entries = write(&self.entries);
        let Some(entry) = entries.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        if !entry
            .connection
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
        {
            return false;
        }
        entry.connection = None;
        entry.hangup_at = Some(Instant::now());
        drop(entries);
        self.bump();
        true
    }

    /// Turns every connected participant into a ghost and hands back the
    /// detached connections.
    pub fn hangup_all(&self) -> Vec<(ParticipantId, Arc<Connection>)> {
        let now = Instant::now();
        let mut detached = Vec::new();
        for entry in write(&self.entries).iter_mut() {
            if let Some(connection) = entry.connection.take() {
                entry.hangup_at = Some(now);
                detached.push((entry.id, connection));
            }
        }
        self.bump();
        detached
    }

    /// Whether `id` could reenter within `grace` right now.
    pub fn check_resurrect(&self, id: ParticipantId, grace: Duration) -> Result<(), ResurrectError> {
        let entries = read(&self.entries);
        let entry = entries
            .iter()
            .find(|p| p.id == id)
            .ok_or(ResurrectError::Unknown)?;
        entry.resurrectable(grace)
    }

    /// Reattaches a ghost that asked to reenter within `grace`.
    pub fn resurrect(
        &self,
        id: ParticipantId,
        connection: Arc<Connection>,
        grace: Duration,
    ) -> Result<(), ResurrectError> {
        let mut entries = write(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(ResurrectError::Unknown)?;
        entry.resurrectable(grace)?;
        entry.connection = Some(connection);
        entry.hangup_at = None;
        drop(entries);
        self.bump();
        Ok(())
    }

    /// Attaches `connection` to a known participant whatever its state and
    /// returns the connection it replaces.
    pub fn attach(
        &self,
        id: ParticipantId,
        connection: Arc<Connection>,
    ) -> EngineResult<Option<Arc<Connection>>> {
        let mut entries = write(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::invalid_argument(format!("unknown participant {id:016x}")))?;
        let previous = entry.connection.replace(connection);
        entry.hangup_at = None;
        drop(entries);
        self.bump();
        Ok(previous)
    }

    /// Removes ghosts whose grace window is over.
    pub fn sweep_expired(&self, grace: Duration) -> Vec<Participant> {
        let mut entries = write(&self.entries);
        if !entries.iter().any(|p| p.expired(grace)) {
            return Vec::new();
        }
        let (expired, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *entries).into_iter().partition(|p| p.expired(grace));
        *entries = kept;
        drop(entries);
        self.bump();
        expired
    }

    /// Applies a rename or role change announced by the participant.
    pub fn update_info(&self, id: ParticipantId, role: Role, name: &str) -> bool {
        let mut entries = write(&self.entries);
        let Some(entry) = entries.iter_mut().find(|p| p.id == id) else {
            return false;
        };
        entry.role = role;
        entry.name = name.to_string();
        true
    }
}

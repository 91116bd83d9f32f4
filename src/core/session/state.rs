//! Session record and its state machine.

use crate::core::catalog::{Catalog, Origin};
use crate::core::pipeline::queue::DownloadQueue;
use crate::core::pipeline::receiver::ReceivedFile;
use std::collections::HashMap;
use std::fmt;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Joiner,
}

/// Connection-level phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Hosting,
    Joining,
    Negotiating,
    Connected,
}

/// Observable session state. `Connected` splits on whether a download
/// queue is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Hosting,
    Joining,
    Negotiating,
    ConnectedIdle,
    Downloading,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Hosting => "hosting",
            SessionState::Joining => "joining",
            SessionState::Negotiating => "negotiating",
            SessionState::ConnectedIdle => "connected",
            SessionState::Downloading => "downloading",
        };
        f.write_str(s)
    }
}

/// Everything one peer knows about the current session.
///
/// Lives from create/join until reset. Catalogs, the queue and received
/// artifacts never outlive it.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub role: Option<Role>,
    pub room: Option<String>,
    pub phase: Phase,
    pub local: Catalog,
    pub remote: Catalog,
    pub queue: Option<DownloadQueue>,
    pub downloads: HashMap<String, ReceivedFile>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            role: None,
            room: None,
            phase: Phase::Idle,
            local: Catalog::new(Origin::Local),
            remote: Catalog::new(Origin::Remote),
            queue: None,
            downloads: HashMap::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self.phase {
            Phase::Idle => SessionState::Idle,
            Phase::Hosting => SessionState::Hosting,
            Phase::Joining => SessionState::Joining,
            Phase::Negotiating => SessionState::Negotiating,
            Phase::Connected if self.queue.is_some() => SessionState::Downloading,
            Phase::Connected => SessionState::ConnectedIdle,
        }
    }

    pub fn is_host(&self) -> bool {
        self.role == Some(Role::Host)
    }

    pub fn is_joiner(&self) -> bool {
        self.role == Some(Role::Joiner)
    }

    /// Start a new session under `role`. Local files selected while idle
    /// carry over.
    pub fn begin(&mut self, role: Role, room: Option<String>, phase: Phase) {
        self.id = Uuid::new_v4();
        self.role = Some(role);
        self.room = room;
        self.transition(phase);
    }

    pub fn transition(&mut self, to: Phase) {
        if self.phase == to {
            return;
        }
        info!(
            event = "session_transition",
            session = %self.id,
            from = ?self.phase,
            to = ?to,
            "Session phase changed"
        );
        self.phase = to;
    }

    /// Drop everything learned from the current peer while keeping the
    /// room itself.
    pub fn clear_peer(&mut self) {
        self.remote.clear();
        self.queue = None;
        self.downloads.clear();
    }

    /// Discard the whole session.
    pub fn reset(&mut self) {
        self.transition(Phase::Idle);
        self.role = None;
        self.room = None;
        self.local.clear();
        self.clear_peer();
        self.id = Uuid::new_v4();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::LocalFile;
    use bytes::Bytes;

    #[test]
    fn connected_splits_on_queue() {
        let mut session = Session::new();
        session.begin(Role::Joiner, Some("1234".into()), Phase::Joining);
        assert_eq!(session.state(), SessionState::Joining);

        session.transition(Phase::Connected);
        assert_eq!(session.state(), SessionState::ConnectedIdle);

        session.queue = Some(DownloadQueue::new());
        assert_eq!(session.state(), SessionState::Downloading);
    }

    #[test]
    fn reset_discards_everything() {
        let mut session = Session::new();
        session
            .local
            .insert(LocalFile::from_bytes("a", "text/plain", Bytes::from_static(b"x")).into());
        session.begin(Role::Host, Some("4821".into()), Phase::Hosting);
        session.queue = Some(DownloadQueue::new());

        session.reset();
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.role.is_none());
        assert!(session.room.is_none());
        assert!(session.local.is_empty());
        assert!(session.queue.is_none());
    }
}

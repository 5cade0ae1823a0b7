// Session pool: pending/active pairings of one master and one onsite device

use std::fmt;

use tundev_common::error::{ManagerError, Result};
use tundev_common::types::InterfaceStatus;

/// Derived status of a session, a pure function of which sides have a live
/// tunnel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Down,
    InProgress,
    Up,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Down => f.write_str("down"),
            SessionState::InProgress => f.write_str("in-progress"),
            SessionState::Up => f.write_str("up"),
        }
    }
}

/// One master/onsite pairing and the interfaces each side has reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub master_id: String,
    pub onsite_id: String,
    pub master_iface: Option<String>,
    pub onsite_iface: Option<String>,
}

impl Session {
    pub fn new(master_id: &str, onsite_id: &str) -> Self {
        Session {
            master_id: master_id.to_string(),
            onsite_id: onsite_id.to_string(),
            master_iface: None,
            onsite_iface: None,
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.master_iface, &self.onsite_iface) {
            (None, None) => SessionState::Down,
            (Some(_), Some(_)) => SessionState::Up,
            _ => SessionState::InProgress,
        }
    }

    pub fn involves(&self, username: &str) -> bool {
        self.master_id == username || self.onsite_id == username
    }

    /// The other participant of a session `username` is part of.
    pub fn peer_of(&self, username: &str) -> &str {
        if self.master_id == username {
            &self.onsite_id
        } else {
            &self.master_id
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} <=> {} [{}]",
            self.master_id,
            self.onsite_id,
            self.state()
        )
    }
}

/// One interface-status transition observed by `update_iface`: the session
/// as it was before the update and as it is now.
#[derive(Debug, Clone)]
pub struct SessionTransition {
    pub before: Session,
    pub after: Session,
}

impl SessionTransition {
    pub fn previous_state(&self) -> SessionState {
        self.before.state()
    }

    pub fn new_state(&self) -> SessionState {
        self.after.state()
    }
}

/// Ordered collection of sessions. The manager serialises access behind its
/// sessions lock; the pool itself is plain data.
#[derive(Debug, Default)]
pub struct SessionPool {
    sessions: Vec<Session>,
}

impl SessionPool {
    pub fn new() -> Self {
        SessionPool::default()
    }

    /// Record a new pairing.
    ///
    /// Rejects the call when an equal session already exists and, because a
    /// username may participate in at most one session at a time, when
    /// either device is already paired elsewhere.
    pub fn add(&mut self, master_id: &str, onsite_id: &str) -> Result<()> {
        if self
            .sessions
            .iter()
            .any(|s| s.involves(master_id) || s.involves(onsite_id))
        {
            return Err(ManagerError::DevicesAlreadyConnected {
                master: master_id.to_string(),
                onsite: onsite_id.to_string(),
            });
        }
        self.sessions.push(Session::new(master_id, onsite_id));
        Ok(())
    }

    /// Apply an interface up/down report from `device_id` to every session
    /// it participates in, returning one transition per affected session.
    pub fn update_iface(
        &mut self,
        device_id: &str,
        iface: &str,
        status: InterfaceStatus,
    ) -> Vec<SessionTransition> {
        let mut transitions = Vec::new();
        for session in self.sessions.iter_mut().filter(|s| s.involves(device_id)) {
            let before = session.clone();
            let side = if session.master_id == device_id {
                &mut session.master_iface
            } else {
                &mut session.onsite_iface
            };
            *side = match status {
                InterfaceStatus::Up => Some(iface.to_string()),
                InterfaceStatus::Down => None,
            };
            transitions.push(SessionTransition {
                before,
                after: session.clone(),
            });
        }
        transitions
    }

    /// Drop every session `username` participates in and return them, so
    /// the caller can tear down the peers' tunnels and kernel state.
    pub fn remove_involving(&mut self, username: &str) -> Vec<Session> {
        let (removed, kept): (Vec<Session>, Vec<Session>) = self
            .sessions
            .drain(..)
            .partition(|s| s.involves(username));
        self.sessions = kept;
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn find_by_master(&self, master_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.master_id == master_id)
    }

    /// True when any session other than `(master, onsite)` is currently up.
    /// Drives the decision to leave IP forwarding enabled on unstitch.
    pub fn any_other_up(&self, master_id: &str, onsite_id: &str) -> bool {
        self.sessions.iter().any(|s| {
            s.state() == SessionState::Up
                && !(s.master_id == master_id && s.onsite_id == onsite_id)
        })
    }

    pub fn describe_all(&self) -> Vec<String> {
        self.sessions.iter().map(Session::describe).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_derivation_covers_every_combination() {
        let mut session = Session::new("master_a", "onsite_a");
        assert_eq!(session.state(), SessionState::Down);

        session.master_iface = Some("tun_to_master_a".into());
        assert_eq!(session.state(), SessionState::InProgress);

        session.onsite_iface = Some("tun_to_onsite_a".into());
        assert_eq!(session.state(), SessionState::Up);

        session.master_iface = None;
        assert_eq!(session.state(), SessionState::InProgress);

        session.onsite_iface = None;
        assert_eq!(session.state(), SessionState::Down);
    }

    #[test]
    fn duplicate_pairing_is_rejected() {
        let mut pool = SessionPool::new();
        pool.add("master_a", "onsite_a").unwrap();
        let err = pool.add("master_a", "onsite_a").unwrap_err();
        assert_eq!(err.code(), "DevicesAlreadyConnected");
    }

    #[test]
    fn a_device_joins_at_most_one_session() {
        let mut pool = SessionPool::new();
        pool.add("master_a", "onsite_a").unwrap();
        assert!(pool.add("master_a", "onsite_b").is_err());
        assert!(pool.add("master_b", "onsite_a").is_err());
        pool.add("master_b", "onsite_b").unwrap();
    }

    #[test]
    fn update_iface_reports_the_transition() {
        let mut pool = SessionPool::new();
        pool.add("master_a", "onsite_a").unwrap();

        let ups = pool.update_iface("onsite_a", "tun_to_onsite_a", InterfaceStatus::Up);
        assert_eq!(ups.len(), 1);
        assert_eq!(ups[0].previous_state(), SessionState::Down);
        assert_eq!(ups[0].new_state(), SessionState::InProgress);

        let ups = pool.update_iface("master_a", "tun_to_master_a", InterfaceStatus::Up);
        assert_eq!(ups[0].previous_state(), SessionState::InProgress);
        assert_eq!(ups[0].new_state(), SessionState::Up);

        let downs = pool.update_iface("onsite_a", "tun_to_onsite_a", InterfaceStatus::Down);
        assert_eq!(downs[0].previous_state(), SessionState::Up);
        assert_eq!(downs[0].new_state(), SessionState::InProgress);
        // The pre-update snapshot still carries both interface names, which
        // the unstitch path needs
        assert_eq!(
            downs[0].before.onsite_iface.as_deref(),
            Some("tun_to_onsite_a")
        );
    }

    #[test]
    fn update_for_uninvolved_device_touches_nothing() {
        let mut pool = SessionPool::new();
        pool.add("master_a", "onsite_a").unwrap();
        let transitions = pool.update_iface("onsite_b", "tun_to_onsite_b", InterfaceStatus::Up);
        assert!(transitions.is_empty());
    }

    #[test]
    fn remove_involving_returns_the_dropped_sessions() {
        let mut pool = SessionPool::new();
        pool.add("master_a", "onsite_a").unwrap();
        pool.add("master_b", "onsite_b").unwrap();

        let removed = pool.remove_involving("onsite_a");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].peer_of("onsite_a"), "master_a");
        assert_eq!(pool.iter().count(), 1);
        assert!(pool.iter().all(|s| !s.involves("onsite_a")));
    }

    #[test]
    fn any_other_up_ignores_the_session_being_torn_down() {
        let mut pool = SessionPool::new();
        pool.add("master_a", "onsite_a").unwrap();
        pool.add("master_b", "onsite_b").unwrap();
        pool.update_iface("master_a", "tun_to_master_a", InterfaceStatus::Up);
        pool.update_iface("onsite_a", "tun_to_onsite_a", InterfaceStatus::Up);

        assert!(!pool.any_other_up("master_a", "onsite_a"));

        pool.update_iface("master_b", "tun_to_master_b", InterfaceStatus::Up);
        pool.update_iface("onsite_b", "tun_to_onsite_b", InterfaceStatus::Up);
        assert!(pool.any_other_up("master_a", "onsite_a"));
    }

    #[test]
    fn descriptors_carry_both_ids_and_the_state() {
        let mut pool = SessionPool::new();
        pool.add("master_a", "onsite_a").unwrap();
        assert_eq!(pool.describe_all(), vec!["master_a <=> onsite_a [down]"]);
    }
}

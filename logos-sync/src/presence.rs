//! Presence: who is in the room, where their pointer is, and whether they
//! are still at the keyboard.
//!
//! ## Idle state machine
//!
//! ```text
//!              pointer move                 idle_threshold elapsed
//!   ┌────────┐ ───────────► ┌────────┐ ─────────────────────────► ┌──────┐
//!   │  Idle  │              │ Active │ ◄───────────────────────── │ Idle │
//!   └────────┘              └───┬────┘       pointer move         └──────┘
//!                               │  ▲   every active_threshold:
//!                        hidden │  │   re-broadcast Active
//!                               ▼  │ visible
//!                           ┌──────┴─┐
//!                           │  Away  │
//!                           └────────┘
//! ```
//!
//! The detector owns two deadlines and never spawns anything: the
//! coordinator asks for [`IdleDetector::next_deadline`], sleeps, and calls
//! [`IdleDetector::poll`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::element::ElementId;
use crate::protocol::SocketId;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserIdleState {
    Active,
    Idle,
    Away,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerTool {
    #[default]
    Pointer,
    Laser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    #[default]
    Up,
    Down,
}

/// Pointer position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pointer {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub tool: PointerTool,
}

// ───────────────────────────────────────────────────────────────────
// Idle detector
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct IdleDetector {
    state: UserIdleState,
    idle_threshold: Duration,
    active_threshold: Duration,
    idle_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
}

impl IdleDetector {
    pub fn new(idle_threshold: Duration, active_threshold: Duration) -> Self {
        Self {
            state: UserIdleState::Active,
            idle_threshold,
            active_threshold,
            idle_deadline: None,
            heartbeat_deadline: None,
        }
    }

    pub fn state(&self) -> UserIdleState {
        self.state
    }

    /// Local pointer activity. Returns the new state to broadcast, if any.
    ///
    /// Ignored while `Away`: only visibility brings the user back.
    pub fn on_pointer_move(&mut self, now: Instant) -> Option<UserIdleState> {
        if self.state == UserIdleState::Away {
            return None;
        }
        self.idle_deadline = Some(now + self.idle_threshold);
        if self.heartbeat_deadline.is_none() {
            self.heartbeat_deadline = Some(now + self.active_threshold);
        }
        self.transition(UserIdleState::Active)
    }

    pub fn on_visibility_change(&mut self, hidden: bool, now: Instant) -> Option<UserIdleState> {
        if hidden {
            self.idle_deadline = None;
            self.heartbeat_deadline = None;
            self.transition(UserIdleState::Away)
        } else {
            self.idle_deadline = Some(now + self.idle_threshold);
            self.heartbeat_deadline = Some(now + self.active_threshold);
            self.transition(UserIdleState::Active)
        }
    }

    /// Fire due timers. An `Active` return from the heartbeat is a
    /// re-broadcast, not a transition.
    pub fn poll(&mut self, now: Instant) -> Option<UserIdleState> {
        if self.idle_deadline.is_some_and(|d| now >= d) {
            self.idle_deadline = None;
            self.heartbeat_deadline = None;
            return self.transition(UserIdleState::Idle);
        }
        if self.heartbeat_deadline.is_some_and(|d| now >= d) {
            self.heartbeat_deadline = Some(now + self.active_threshold);
            return Some(UserIdleState::Active);
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.idle_deadline, self.heartbeat_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Stop both timers and forget the state.
    pub fn reset(&mut self) {
        self.state = UserIdleState::Active;
        self.idle_deadline = None;
        self.heartbeat_deadline = None;
    }

    fn transition(&mut self, next: UserIdleState) -> Option<UserIdleState> {
        if self.state == next {
            return None;
        }
        log::trace!("Idle state {:?} -> {:?}", self.state, next);
        self.state = next;
        Some(next)
    }
}

// ───────────────────────────────────────────────────────────────────
// Collaborators
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Collaborator {
    pub socket_id: SocketId,
    pub pointer: Option<Pointer>,
    pub button: Option<PointerButton>,
    pub selected_element_ids: Vec<ElementId>,
    pub username: Option<String>,
    pub user_state: Option<UserIdleState>,
    pub is_current_user: bool,
}

/// Partial update for one collaborator. `None` fields keep their value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollaboratorPatch {
    pub pointer: Option<Pointer>,
    pub button: Option<PointerButton>,
    pub selected_element_ids: Option<Vec<ElementId>>,
    pub username: Option<String>,
    pub user_state: Option<UserIdleState>,
}

#[derive(Debug, Default)]
pub struct CollaboratorMap {
    members: HashMap<SocketId, Collaborator>,
}

impl CollaboratorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the membership list. Surviving members keep what we knew
    /// about them.
    pub fn set_members(&mut self, socket_ids: &[SocketId], own_socket: Option<&str>) {
        let mut next = HashMap::with_capacity(socket_ids.len());
        for socket_id in socket_ids {
            let mut member = self.members.remove(socket_id).unwrap_or_else(|| Collaborator {
                socket_id: socket_id.clone(),
                ..Collaborator::default()
            });
            member.is_current_user = own_socket == Some(socket_id.as_str());
            next.insert(socket_id.clone(), member);
        }
        self.members = next;
    }

    /// Merge `patch` into one member, creating it if unknown.
    pub fn update(&mut self, socket_id: &str, patch: CollaboratorPatch, own_socket: Option<&str>) {
        let member = self
            .members
            .entry(socket_id.to_string())
            .or_insert_with(|| Collaborator {
                socket_id: socket_id.to_string(),
                ..Collaborator::default()
            });
        if let Some(pointer) = patch.pointer {
            member.pointer = Some(pointer);
        }
        if let Some(button) = patch.button {
            member.button = Some(button);
        }
        if let Some(ids) = patch.selected_element_ids {
            member.selected_element_ids = ids;
        }
        if let Some(username) = patch.username {
            member.username = Some(username);
        }
        if let Some(state) = patch.user_state {
            member.user_state = Some(state);
        }
        member.is_current_user = own_socket == Some(socket_id);
    }

    pub fn get(&self, socket_id: &str) -> Option<&Collaborator> {
        self.members.get(socket_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Members sorted by socket id.
    pub fn snapshot(&self) -> Vec<Collaborator> {
        let mut members: Vec<Collaborator> = self.members.values().cloned().collect();
        members.sort_by(|a, b| a.socket_id.cmp(&b.socket_id));
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(60);
    const ACTIVE: Duration = Duration::from_secs(3);

    fn detector() -> IdleDetector {
        IdleDetector::new(IDLE, ACTIVE)
    }

    // ─── Idle detector ────────────────────────────────────────────

    #[test]
    fn test_starts_active_without_timers() {
        let d = detector();
        assert_eq!(d.state(), UserIdleState::Active);
        assert!(d.next_deadline().is_none());
    }

    #[test]
    fn test_pointer_move_arms_timers() {
        let now = Instant::now();
        let mut d = detector();
        assert_eq!(d.on_pointer_move(now), None);
        assert_eq!(d.next_deadline(), Some(now + ACTIVE));
    }

    #[test]
    fn test_heartbeat_rebroadcasts_active() {
        let now = Instant::now();
        let mut d = detector();
        d.on_pointer_move(now);
        assert_eq!(d.poll(now + ACTIVE), Some(UserIdleState::Active));
        assert_eq!(d.next_deadline(), Some(now + ACTIVE * 2));
        assert_eq!(d.poll(now + ACTIVE), None);
    }

    #[test]
    fn test_goes_idle_after_threshold() {
        let now = Instant::now();
        let mut d = detector();
        d.on_pointer_move(now);
        assert_eq!(d.poll(now + IDLE), Some(UserIdleState::Idle));
        assert_eq!(d.state(), UserIdleState::Idle);
        assert!(d.next_deadline().is_none());
    }

    #[test]
    fn test_pointer_move_wakes_from_idle() {
        let now = Instant::now();
        let mut d = detector();
        d.on_pointer_move(now);
        d.poll(now + IDLE);
        assert_eq!(d.on_pointer_move(now + IDLE), Some(UserIdleState::Active));
    }

    #[test]
    fn test_hidden_forces_away() {
        let now = Instant::now();
        let mut d = detector();
        d.on_pointer_move(now);
        assert_eq!(d.on_visibility_change(true, now), Some(UserIdleState::Away));
        assert!(d.next_deadline().is_none());
        assert_eq!(d.on_pointer_move(now), None);
        assert_eq!(d.state(), UserIdleState::Away);
    }

    #[test]
    fn test_visible_restarts_timers() {
        let now = Instant::now();
        let mut d = detector();
        d.on_visibility_change(true, now);
        assert_eq!(d.on_visibility_change(false, now), Some(UserIdleState::Active));
        assert_eq!(d.next_deadline(), Some(now + ACTIVE));
    }

    // ─── Collaborators ────────────────────────────────────────────

    #[test]
    fn test_set_members_keeps_known_fields() {
        let mut map = CollaboratorMap::new();
        map.set_members(&["a".into(), "b".into()], Some("a"));
        map.update(
            "b",
            CollaboratorPatch {
                username: Some("Bo".into()),
                ..Default::default()
            },
            Some("a"),
        );

        map.set_members(&["b".into(), "c".into()], Some("a"));
        assert_eq!(map.len(), 2);
        assert!(map.get("a").is_none());
        assert_eq!(map.get("b").unwrap().username.as_deref(), Some("Bo"));
        assert!(!map.get("c").unwrap().is_current_user);
    }

    #[test]
    fn test_current_user_flag() {
        let mut map = CollaboratorMap::new();
        map.set_members(&["me".into(), "you".into()], Some("me"));
        assert!(map.get("me").unwrap().is_current_user);
        assert!(!map.get("you").unwrap().is_current_user);
    }

    #[test]
    fn test_update_only_touches_one_peer() {
        let mut map = CollaboratorMap::new();
        map.set_members(&["a".into(), "b".into()], None);
        map.update(
            "a",
            CollaboratorPatch {
                user_state: Some(UserIdleState::Idle),
                ..Default::default()
            },
            None,
        );
        assert_eq!(map.get("a").unwrap().user_state, Some(UserIdleState::Idle));
        assert_eq!(map.get("b").unwrap().user_state, None);
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut map = CollaboratorMap::new();
        map.set_members(&["z".into(), "m".into(), "a".into()], None);
        let ids: Vec<_> = map.snapshot().into_iter().map(|c| c.socket_id).collect();
        assert_eq!(ids, ["a", "m", "z"]);
    }
}

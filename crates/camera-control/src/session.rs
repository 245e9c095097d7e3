//! Arbitration between sessions sharing one camera

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// Identifier of one consumer of the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}

/// Sessions that currently want the stream running.
///
/// The stream is active exactly when this set is non-empty; after a
/// stop the lowest remaining id takes the stream back.
#[derive(Debug, Default, Clone)]
pub struct SessionArbiter {
    interested: BTreeSet<SessionId>,
}

impl SessionArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest; returns false if already registered
    pub fn insert(&mut self, id: SessionId) -> bool {
        self.interested.insert(id)
    }

    pub fn remove(&mut self, id: SessionId) -> bool {
        self.interested.remove(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.interested.contains(&id)
    }

    /// Session that restarts the stream after another stops
    pub fn next_owner(&self) -> Option<SessionId> {
        self.interested.first().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.interested.is_empty()
    }

    pub fn len(&self) -> usize {
        self.interested.len()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.interested.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_id_owns_restart() {
        let mut arbiter = SessionArbiter::new();
        arbiter.insert(SessionId(7));
        arbiter.insert(SessionId(3));
        arbiter.insert(SessionId(5));
        assert_eq!(arbiter.next_owner(), Some(SessionId(3)));

        arbiter.remove(SessionId(3));
        assert_eq!(arbiter.next_owner(), Some(SessionId(5)));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut arbiter = SessionArbiter::new();
        assert!(arbiter.insert(SessionId(1)));
        assert!(!arbiter.insert(SessionId(1)));
        assert_eq!(arbiter.len(), 1);
        assert!(arbiter.remove(SessionId(1)));
        assert!(!arbiter.remove(SessionId(1)));
        assert!(arbiter.is_empty());
    }
}

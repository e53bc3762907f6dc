//! Group abstraction for Huddle.
//!
//! Groups are named broadcast domains. A group only records which
//! connections are members; it never owns their transports.

use crate::connection::ConnectionHandle;
use huddle_transport::ConnectionId;
use std::collections::HashMap;
use tracing::debug;

/// Maximum group identifier length in bytes.
pub const MAX_GROUP_ID_LENGTH: usize = 256;

/// A group identifier.
pub type GroupId = String;

/// Validate a group identifier.
///
/// # Errors
///
/// Returns an error message if the identifier is invalid.
pub fn validate_group_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Group id cannot be empty");
    }
    if id.len() > MAX_GROUP_ID_LENGTH {
        return Err("Group id too long");
    }
    if id.chars().any(char::is_control) {
        return Err("Group id contains control characters");
    }
    Ok(())
}

/// A group and its current members.
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl Group {
    /// Create an empty group.
    #[must_use]
    pub fn new(id: impl Into<GroupId>) -> Self {
        Self {
            id: id.into(),
            members: HashMap::new(),
        }
    }

    /// Get the group ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.members.contains_key(connection_id)
    }

    /// Add a member. Returns `false` if it was already present.
    pub fn insert(&mut self, connection: ConnectionHandle) -> bool {
        let id = connection.id().clone();
        if self.members.contains_key(&id) {
            return false;
        }
        debug!(group = %self.id, connection = %id, "Member added");
        self.members.insert(id, connection);
        true
    }

    /// Remove a member. Returns `false` if it was not present.
    pub fn remove(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.members.remove(connection_id).is_some();
        if removed {
            debug!(group = %self.id, connection = %connection_id, "Member removed");
        }
        removed
    }

    /// Copy out the members that are still active.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.members
            .values()
            .filter(|member| member.is_active())
            .cloned()
            .collect()
    }

    /// Get every member handle regardless of state.
    #[must_use]
    pub fn members(&self) -> Vec<ConnectionHandle> {
        self.members.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> ConnectionHandle {
        let (handle, _outbox) = ConnectionHandle::new(id.into(), 1);
        handle
    }

    #[test]
    fn test_group_creation() {
        let group = Group::new("farmers:pune");
        assert_eq!(group.id(), "farmers:pune");
        assert_eq!(group.len(), 0);
        assert!(group.is_empty());
    }

    #[test]
    fn test_group_insert_remove() {
        let mut group = Group::new("g1");
        let c1 = handle("conn-1");

        assert!(group.insert(c1.clone()));
        assert!(!group.insert(c1.clone()));
        assert_eq!(group.len(), 1);
        assert!(group.contains(c1.id()));

        assert!(group.remove(c1.id()));
        assert!(!group.remove(c1.id()));
        assert!(group.is_empty());
    }

    #[test]
    fn test_snapshot_skips_inactive_members() {
        let mut group = Group::new("g1");
        let active = handle("active");
        active.activate();
        let connecting = handle("connecting");
        let closed = handle("closed");
        closed.activate();
        closed.close();

        group.insert(active.clone());
        group.insert(connecting);
        group.insert(closed);

        let snapshot = group.snapshot();
        assert_eq!(snapshot, vec![active]);
        assert_eq!(group.members().len(), 3);
    }

    #[test]
    fn test_group_id_validation() {
        assert!(validate_group_id("g1").is_ok());
        assert!(validate_group_id("krishi mandi/नाशिक").is_ok());
        assert!(validate_group_id("").is_err());
        assert!(validate_group_id("bad\nid").is_err());

        let long_id = "a".repeat(MAX_GROUP_ID_LENGTH + 1);
        assert!(validate_group_id(&long_id).is_err());
    }
}

//! Group membership registry.
//!
//! The registry is the only owner of the "connection belongs to group"
//! relation. Joins, leaves and snapshots go through it; nothing else touches
//! a group's member set.
//!
//! Locking order is always `memberships` then `groups`. Snapshots only lock
//! `groups`, and never hold a shard guard past the copy.

use crate::connection::{ConnectionHandle, ConnectionState};
use crate::group::{Group, GroupId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use huddle_transport::ConnectionId;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The connection is already a member of a group.
    #[error("Connection {connection} already joined group {group}")]
    AlreadyJoined {
        /// Connection that tried to join.
        connection: ConnectionId,
        /// Group it already belongs to.
        group: GroupId,
    },

    /// The connection is closed and can no longer join.
    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The group was not declared and auto-creation is disabled.
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    /// Creating the group would exceed the configured limit.
    #[error("Maximum groups reached ({0})")]
    MaxGroupsReached(usize),
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Create groups on first join. When disabled only declared groups exist.
    pub auto_create_groups: bool,
    /// Maximum number of groups.
    pub max_groups: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auto_create_groups: true,
            max_groups: 10_000,
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of groups, including empty ones.
    pub group_count: usize,
    /// Number of connections that are members of a group.
    pub connection_count: usize,
}

/// Process-wide mapping from group ID to member connections.
///
/// Starts empty. Groups are never removed; an empty group is harmless.
pub struct GroupRegistry {
    groups: DashMap<GroupId, Group>,
    memberships: DashMap<ConnectionId, GroupId>,
    group_count: AtomicUsize,
    config: RegistryConfig,
}

impl GroupRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating group registry with config: {:?}", config);
        Self {
            groups: DashMap::new(),
            memberships: DashMap::new(),
            group_count: AtomicUsize::new(0),
            config,
        }
    }

    /// Create a group ahead of any join.
    ///
    /// Returns `true` if the group did not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MaxGroupsReached`] if the limit is hit.
    pub fn declare(&self, group_id: &str) -> Result<bool, RegistryError> {
        match self.groups.entry(group_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                self.reserve_group_slot()?;
                vacant.insert(Group::new(group_id));
                debug!(group = %group_id, "Declared group");
                Ok(true)
            }
        }
    }

    /// Add a connection to a group and mark it active.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyJoined`] if the connection is a member
    /// of any group, [`RegistryError::ConnectionClosed`] if it is closed, and
    /// [`RegistryError::UnknownGroup`] or [`RegistryError::MaxGroupsReached`]
    /// when the group cannot be created.
    pub fn join(&self, group_id: &str, connection: &ConnectionHandle) -> Result<(), RegistryError> {
        let membership = match self.memberships.entry(connection.id().clone()) {
            Entry::Occupied(existing) => {
                return Err(RegistryError::AlreadyJoined {
                    connection: connection.id().clone(),
                    group: existing.get().clone(),
                });
            }
            Entry::Vacant(vacant) => vacant,
        };

        if connection.state() == ConnectionState::Closed {
            return Err(RegistryError::ConnectionClosed(connection.id().clone()));
        }

        let mut group = match self.groups.entry(group_id.to_string()) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => {
                if !self.config.auto_create_groups {
                    return Err(RegistryError::UnknownGroup(group_id.to_string()));
                }
                self.reserve_group_slot()?;
                debug!(group = %group_id, "Creating new group");
                vacant.insert(Group::new(group_id))
            }
        };

        // Activation happens under the group lock so a snapshot never sees a
        // member that is present but still connecting.
        if !connection.activate() {
            return Err(RegistryError::ConnectionClosed(connection.id().clone()));
        }
        group.insert(connection.clone());
        let members = group.len();
        drop(group);
        membership.insert(group_id.to_string());

        debug!(
            group = %group_id,
            connection = %connection.id(),
            members,
            "Joined"
        );

        Ok(())
    }

    /// Remove a connection from a group.
    ///
    /// Removing a connection that is not a member is a no-op. Returns `true`
    /// if the connection was removed.
    pub fn leave(&self, group_id: &str, connection: &ConnectionHandle) -> bool {
        let membership = match self.memberships.entry(connection.id().clone()) {
            Entry::Occupied(occupied) if occupied.get() == group_id => Some(occupied),
            _ => None,
        };

        let removed = self
            .groups
            .get_mut(group_id)
            .map(|mut group| group.remove(connection.id()))
            .unwrap_or(false);

        if let Some(membership) = membership {
            membership.remove();
        }

        if removed {
            debug!(group = %group_id, connection = %connection.id(), "Left");
        }

        removed
    }

    /// Copy the active members of a group.
    ///
    /// Unknown groups yield an empty snapshot. The returned list is detached
    /// from the registry and stays valid while joins and leaves continue.
    #[must_use]
    pub fn snapshot(&self, group_id: &str) -> Vec<ConnectionHandle> {
        self.groups
            .get(group_id)
            .map(|group| group.snapshot())
            .unwrap_or_default()
    }

    /// Get the group a connection belongs to.
    #[must_use]
    pub fn group_of(&self, connection_id: &ConnectionId) -> Option<GroupId> {
        self.memberships
            .get(connection_id)
            .map(|group| group.value().clone())
    }

    /// Get the number of members in a group.
    #[must_use]
    pub fn member_count(&self, group_id: &str) -> usize {
        self.groups.get(group_id).map(|g| g.len()).unwrap_or(0)
    }

    /// Check if a group exists.
    #[must_use]
    pub fn group_exists(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Get all group IDs.
    #[must_use]
    pub fn group_ids(&self) -> Vec<GroupId> {
        self.groups.iter().map(|e| e.key().clone()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            group_count: self.groups.len(),
            connection_count: self.memberships.len(),
        }
    }

    /// Close every member connection.
    ///
    /// Each session notices the close and leaves on its own. Returns the
    /// number of connections this call closed.
    pub fn close_all(&self) -> usize {
        let members: Vec<ConnectionHandle> = self
            .groups
            .iter()
            .flat_map(|group| group.members())
            .collect();

        let closed = members.iter().filter(|member| member.close()).count();
        info!(closed, "Closed all member connections");
        closed
    }

    fn reserve_group_slot(&self) -> Result<(), RegistryError> {
        let max = self.config.max_groups;
        self.group_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| RegistryError::MaxGroupsReached(max))
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Chat membership index for Relay.
//!
//! Records, for one gateway instance, which local connections are members
//! of which chats and which of those are actively viewing a chat. The index
//! is a plain data structure: it performs no I/O and no locking of its own.
//! Callers serialize mutations (the gateway keeps it behind a single lock).
//!
//! Every viewer is also a member: opening a chat grants membership if the
//! connection did not already have it.

use crate::session::ConnectionId;
use relay_protocol::ChatId;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Default maximum number of chats a single connection may belong to.
pub const DEFAULT_MAX_CHATS_PER_CONNECTION: usize = 10_000;

/// Membership errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// The connection already belongs to the maximum number of chats.
    #[error("Maximum chats per connection reached ({0})")]
    LimitReached(usize),
}

/// Recipients of a chat event, split by delivery form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audience {
    /// Connections viewing the chat.
    pub viewers: Vec<ConnectionId>,
    /// Members not viewing the chat.
    pub members: Vec<ConnectionId>,
}

impl Audience {
    /// Total number of recipients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.viewers.len() + self.members.len()
    }

    /// Check if nobody would receive the event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty() && self.members.is_empty()
    }
}

/// Per-instance chat membership and active-view index.
#[derive(Debug)]
pub struct MembershipIndex {
    /// Chat -> member connections.
    members: HashMap<ChatId, HashSet<ConnectionId>>,
    /// Chat -> connections currently viewing it. Always a subset of `members`.
    viewers: HashMap<ChatId, HashSet<ConnectionId>>,
    /// Connection -> chats it is a member of, for cleanup without a scan.
    chats: HashMap<ConnectionId, HashSet<ChatId>>,
    max_chats_per_connection: usize,
}

impl MembershipIndex {
    /// Create an empty index with the default per-connection limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_CHATS_PER_CONNECTION)
    }

    /// Create an empty index with a custom per-connection limit.
    #[must_use]
    pub fn with_limit(max_chats_per_connection: usize) -> Self {
        info!(max_chats_per_connection, "Creating membership index");
        Self {
            members: HashMap::new(),
            viewers: HashMap::new(),
            chats: HashMap::new(),
            max_chats_per_connection,
        }
    }

    /// Add a connection to a chat's members.
    ///
    /// Returns `true` if the membership is new.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is at its chat limit.
    pub fn add_membership(
        &mut self,
        connection_id: &ConnectionId,
        chat_id: &str,
    ) -> Result<bool, MembershipError> {
        let conn_chats = self.chats.entry(connection_id.clone()).or_default();

        if conn_chats.contains(chat_id) {
            return Ok(false);
        }
        if conn_chats.len() >= self.max_chats_per_connection {
            return Err(MembershipError::LimitReached(self.max_chats_per_connection));
        }

        conn_chats.insert(chat_id.to_string());
        self.members
            .entry(chat_id.to_string())
            .or_default()
            .insert(connection_id.clone());

        trace!(chat = %chat_id, connection = %connection_id, "Membership added");
        Ok(true)
    }

    /// Remove a connection from a chat entirely, including any active view.
    ///
    /// Returns `true` if the connection was a member.
    pub fn remove_membership(&mut self, connection_id: &ConnectionId, chat_id: &str) -> bool {
        let removed = match self.chats.get_mut(connection_id.as_str()) {
            Some(conn_chats) => conn_chats.remove(chat_id),
            None => false,
        };
        if !removed {
            return false;
        }

        if self
            .chats
            .get(connection_id.as_str())
            .is_some_and(HashSet::is_empty)
        {
            self.chats.remove(connection_id.as_str());
        }
        Self::remove_from(&mut self.viewers, chat_id, connection_id.as_str());
        Self::remove_from(&mut self.members, chat_id, connection_id.as_str());

        trace!(chat = %chat_id, connection = %connection_id, "Membership removed");
        true
    }

    /// Mark a connection as viewing a chat, granting membership if needed.
    ///
    /// Returns `true` if the view is new.
    ///
    /// # Errors
    ///
    /// Returns an error if membership had to be granted and the connection
    /// is at its chat limit.
    pub fn add_view(
        &mut self,
        connection_id: &ConnectionId,
        chat_id: &str,
    ) -> Result<bool, MembershipError> {
        self.add_membership(connection_id, chat_id)?;

        let added = self
            .viewers
            .entry(chat_id.to_string())
            .or_default()
            .insert(connection_id.clone());

        if added {
            trace!(chat = %chat_id, connection = %connection_id, "View added");
        }
        Ok(added)
    }

    /// Stop a connection viewing a chat. Membership is kept.
    ///
    /// Returns `true` if the connection was viewing the chat.
    pub fn remove_view(&mut self, connection_id: &ConnectionId, chat_id: &str) -> bool {
        let removed = Self::remove_from(&mut self.viewers, chat_id, connection_id.as_str());
        if removed {
            trace!(chat = %chat_id, connection = %connection_id, "View removed");
        }
        removed
    }

    /// Get the member connections of a chat.
    #[must_use]
    pub fn members_of(&self, chat_id: &str) -> HashSet<ConnectionId> {
        self.members.get(chat_id).cloned().unwrap_or_default()
    }

    /// Get the connections viewing a chat.
    #[must_use]
    pub fn viewers_of(&self, chat_id: &str) -> HashSet<ConnectionId> {
        self.viewers.get(chat_id).cloned().unwrap_or_default()
    }

    /// Split a chat's members into viewers and non-viewing members.
    ///
    /// Each connection appears in exactly one of the two lists.
    #[must_use]
    pub fn audience(&self, chat_id: &str) -> Audience {
        let viewers = self.viewers.get(chat_id);
        let mut audience = Audience::default();

        if let Some(viewers) = viewers {
            audience.viewers.extend(viewers.iter().cloned());
        }
        if let Some(members) = self.members.get(chat_id) {
            audience.members.extend(
                members
                    .iter()
                    .filter(|c| !viewers.is_some_and(|v| v.contains(*c)))
                    .cloned(),
            );
        }
        audience
    }

    /// Check if a connection is a member of a chat.
    #[must_use]
    pub fn is_member(&self, connection_id: &str, chat_id: &str) -> bool {
        self.members
            .get(chat_id)
            .is_some_and(|m| m.contains(connection_id))
    }

    /// Check if a connection is viewing a chat.
    #[must_use]
    pub fn is_viewer(&self, connection_id: &str, chat_id: &str) -> bool {
        self.viewers
            .get(chat_id)
            .is_some_and(|v| v.contains(connection_id))
    }

    /// Get the chats a connection is a member of.
    #[must_use]
    pub fn chats_of(&self, connection_id: &str) -> Vec<ChatId> {
        self.chats
            .get(connection_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if any local connection belongs to a chat.
    #[must_use]
    pub fn contains_chat(&self, chat_id: &str) -> bool {
        self.members.contains_key(chat_id)
    }

    /// Remove a connection from every chat it belonged to.
    ///
    /// Chats left without members are dropped from the index. Returns the
    /// chats the connection was removed from.
    pub fn cleanup_connection(&mut self, connection_id: &str) -> Vec<ChatId> {
        let Some(conn_chats) = self.chats.remove(connection_id) else {
            return Vec::new();
        };

        for chat_id in &conn_chats {
            Self::remove_from(&mut self.viewers, chat_id, connection_id);
            Self::remove_from(&mut self.members, chat_id, connection_id);
        }

        debug!(
            connection = %connection_id,
            chats = conn_chats.len(),
            "Connection removed from membership index"
        );
        conn_chats.into_iter().collect()
    }

    /// Get index statistics.
    #[must_use]
    pub fn stats(&self) -> MembershipStats {
        MembershipStats {
            chat_count: self.members.len(),
            connection_count: self.chats.len(),
            total_memberships: self.members.values().map(HashSet::len).sum(),
            total_views: self.viewers.values().map(HashSet::len).sum(),
        }
    }

    /// Remove a connection from one chat's set, dropping the set once empty.
    fn remove_from(
        map: &mut HashMap<ChatId, HashSet<ConnectionId>>,
        chat_id: &str,
        connection_id: &str,
    ) -> bool {
        let Some(set) = map.get_mut(chat_id) else {
            return false;
        };
        let removed = set.remove(connection_id);
        if set.is_empty() {
            map.remove(chat_id);
        }
        removed
    }
}

impl Default for MembershipIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Membership index statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipStats {
    /// Number of chats with at least one local member.
    pub chat_count: usize,
    /// Number of connections with at least one membership.
    pub connection_count: usize,
    /// Total number of memberships.
    pub total_memberships: usize,
    /// Total number of active views.
    pub total_views: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test]
    fn test_view_implies_membership() {
        let mut index = MembershipIndex::new();

        assert!(index.add_view(&conn("a"), "chat-1").unwrap());
        assert!(index.is_viewer("a", "chat-1"));
        assert!(index.is_member("a", "chat-1"));
        assert!(index.members_of("chat-1").contains("a"));
        assert!(index.viewers_of("chat-1").contains("a"));
    }

    #[test]
    fn test_add_view_is_idempotent() {
        let mut index = MembershipIndex::new();

        assert!(index.add_view(&conn("a"), "k").unwrap());
        assert!(!index.add_view(&conn("a"), "k").unwrap());
        assert_eq!(index.viewers_of("k").len(), 1);
        assert_eq!(index.members_of("k").len(), 1);
    }

    #[test]
    fn test_remove_view_keeps_membership() {
        let mut index = MembershipIndex::new();
        index.add_view(&conn("a"), "k").unwrap();

        assert!(index.remove_view(&conn("a"), "k"));
        assert!(!index.remove_view(&conn("a"), "k"));
        assert!(!index.is_viewer("a", "k"));
        assert!(index.is_member("a", "k"));
        assert!(index.contains_chat("k"));
    }

    #[test]
    fn test_remove_membership_drops_view() {
        let mut index = MembershipIndex::new();
        index.add_view(&conn("a"), "k").unwrap();

        assert!(index.remove_membership(&conn("a"), "k"));
        assert!(!index.is_viewer("a", "k"));
        assert!(!index.contains_chat("k"));
        assert!(!index.remove_membership(&conn("a"), "k"));
        assert_eq!(index.stats().connection_count, 0);
    }

    #[test]
    fn test_audience_is_exclusive() {
        let mut index = MembershipIndex::new();
        index.add_membership(&conn("a"), "k").unwrap();
        index.add_membership(&conn("b"), "k").unwrap();
        index.add_view(&conn("b"), "k").unwrap();
        index.add_view(&conn("c"), "k").unwrap();

        let mut audience = index.audience("k");
        audience.viewers.sort();
        assert_eq!(audience.viewers, vec![conn("b"), conn("c")]);
        assert_eq!(audience.members, vec![conn("a")]);
        assert_eq!(audience.len(), 3);

        assert!(index.audience("unknown").is_empty());
    }

    #[test]
    fn test_cleanup_connection() {
        let mut index = MembershipIndex::new();
        index.add_membership(&conn("a"), "k1").unwrap();
        index.add_view(&conn("a"), "k2").unwrap();
        index.add_membership(&conn("b"), "k2").unwrap();

        let mut removed = index.cleanup_connection("a");
        removed.sort();
        assert_eq!(removed, vec!["k1".to_string(), "k2".to_string()]);

        // a was the last member of k1
        assert!(!index.contains_chat("k1"));
        assert!(index.contains_chat("k2"));
        assert!(!index.is_member("a", "k2"));
        assert!(index.viewers_of("k2").is_empty());
        assert!(index.chats_of("a").is_empty());

        assert!(index.cleanup_connection("a").is_empty());
    }

    #[test]
    fn test_chat_limit() {
        let mut index = MembershipIndex::with_limit(2);
        index.add_membership(&conn("a"), "k1").unwrap();
        index.add_membership(&conn("a"), "k2").unwrap();

        // Re-adding an existing membership is not limited.
        assert_eq!(index.add_membership(&conn("a"), "k1"), Ok(false));
        assert_eq!(
            index.add_view(&conn("a"), "k3"),
            Err(MembershipError::LimitReached(2))
        );
        assert!(!index.contains_chat("k3"));
    }

    #[test]
    fn test_stats() {
        let mut index = MembershipIndex::new();
        index.add_membership(&conn("a"), "k1").unwrap();
        index.add_view(&conn("a"), "k2").unwrap();
        index.add_view(&conn("b"), "k1").unwrap();

        let stats = index.stats();
        assert_eq!(stats.chat_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.total_memberships, 3);
        assert_eq!(stats.total_views, 2);
    }
}

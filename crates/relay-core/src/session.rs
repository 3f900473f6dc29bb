//! Session registry for Relay.
//!
//! Tracks every live local connection, the user it registered as, and the
//! outbox used to emit events to it. A user is online while at least one of
//! their connections is registered here.

use dashmap::DashMap;
use relay_protocol::{ServerEvent, UserId};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Sending half of a connection's outbound event queue.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    ///
    /// Ids are compared across instances for sender exclusion, so they must
    /// be unique cluster-wide, not only within this process.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A live connection.
struct Session {
    /// Set once, by the first successful registration.
    user: Option<UserId>,
    outbox: Outbox,
}

/// Registry of live local connections.
#[derive(Default)]
pub struct SessionRegistry {
    /// All open connections, registered or not.
    sessions: DashMap<ConnectionId, Session>,
    /// Registered connections per user.
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened connection. It is not online until registered.
    pub fn open(&self, connection_id: ConnectionId, outbox: Outbox) {
        debug!(connection = %connection_id, "Session opened");
        self.sessions.insert(connection_id, Session { user: None, outbox });
    }

    /// Check if a connection is open, registered or not.
    #[must_use]
    pub fn is_open(&self, connection_id: &str) -> bool {
        self.sessions.contains_key(connection_id)
    }

    /// Associate an open connection with a user and mark it online.
    ///
    /// Returns `false` without changing anything if the connection is
    /// unknown or already registered.
    pub fn register(&self, connection_id: &ConnectionId, user_id: &str) -> bool {
        {
            let Some(mut session) = self.sessions.get_mut(connection_id.as_str()) else {
                return false;
            };
            if session.user.is_some() {
                return false;
            }
            session.user = Some(user_id.to_string());
        }

        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.clone());

        debug!(connection = %connection_id, user = %user_id, "Session registered");
        true
    }

    /// Check if a connection is registered and still open.
    #[must_use]
    pub fn is_online(&self, connection_id: &str) -> bool {
        self.sessions
            .get(connection_id)
            .is_some_and(|s| s.user.is_some())
    }

    /// Get the user a connection registered as.
    #[must_use]
    pub fn user_of(&self, connection_id: &str) -> Option<UserId> {
        self.sessions.get(connection_id)?.user.clone()
    }

    /// Get every registered connection of a user.
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|conns| conns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a user has at least one registered connection.
    #[must_use]
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.users.get(user_id).is_some_and(|c| !c.is_empty())
    }

    /// Queue an event for a registered connection.
    ///
    /// Returns `false` if the connection is gone, not registered, or its
    /// outbox has been dropped.
    pub fn deliver(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.sessions.get(connection_id) {
            Some(session) if session.user.is_some() => session.outbox.send(event).is_ok(),
            _ => false,
        }
    }

    /// Forget a connection.
    ///
    /// Returns the user it was registered as, if any. The user entry is
    /// removed once their last connection closes.
    pub fn close(&self, connection_id: &str) -> Option<UserId> {
        let (_, session) = self.sessions.remove(connection_id)?;
        let user_id = session.user?;

        if let Some(mut conns) = self.users.get_mut(&user_id) {
            conns.remove(connection_id);
        }
        self.users.remove_if(&user_id, |_, conns| conns.is_empty());

        debug!(connection = %connection_id, user = %user_id, "Session closed");
        Some(user_id)
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            open_connections: self.sessions.len(),
            online_users: self.users.len(),
        }
    }
}

/// Session registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Number of open connections, registered or not.
    pub open_connections: usize,
    /// Number of users with at least one registered connection.
    pub online_users: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(registry: &SessionRegistry, id: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.open(ConnectionId::from(id), tx);
        rx
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_connection_ids_carry_no_process_state() {
        // A counter or clock based id repeats across instances started together.
        let ids: HashSet<ConnectionId> = (0..10_000).map(|_| ConnectionId::generate()).collect();
        assert_eq!(ids.len(), 10_000);

        let id = ConnectionId::generate();
        let suffix = id.as_str().trim_start_matches("conn_");
        assert_eq!(suffix.len(), 32);
        assert!(Uuid::parse_str(suffix).is_ok_and(|u| u.get_version_num() == 4));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = SessionRegistry::new();
        let _rx = open(&registry, "conn-1");
        let conn = ConnectionId::from("conn-1");

        assert!(!registry.is_online("conn-1"));
        assert!(registry.register(&conn, "alice"));
        assert!(registry.is_online("conn-1"));

        assert!(!registry.register(&conn, "alice"));
        assert!(!registry.register(&conn, "mallory"));
        assert_eq!(registry.user_of("conn-1").as_deref(), Some("alice"));
        assert_eq!(registry.connections_of("alice").len(), 1);
    }

    #[test]
    fn test_register_unknown_connection() {
        let registry = SessionRegistry::new();
        assert!(!registry.register(&ConnectionId::from("ghost"), "alice"));
        assert!(!registry.is_user_online("alice"));
    }

    #[test]
    fn test_multi_device_presence() {
        let registry = SessionRegistry::new();
        let _rx1 = open(&registry, "phone");
        let _rx2 = open(&registry, "laptop");
        registry.register(&ConnectionId::from("phone"), "alice");
        registry.register(&ConnectionId::from("laptop"), "alice");

        assert_eq!(registry.connections_of("alice").len(), 2);

        assert_eq!(registry.close("phone").as_deref(), Some("alice"));
        assert!(registry.is_user_online("alice"));

        registry.close("laptop");
        assert!(!registry.is_user_online("alice"));
        assert_eq!(registry.stats().online_users, 0);
    }

    #[test]
    fn test_deliver_requires_registration() {
        let registry = SessionRegistry::new();
        let mut rx = open(&registry, "conn-1");

        assert!(!registry.deliver("conn-1", ServerEvent::error(1, "x")));
        assert!(rx.try_recv().is_err());

        registry.register(&ConnectionId::from("conn-1"), "bob");
        assert!(registry.deliver("conn-1", ServerEvent::error(2, "y")));
        assert!(rx.try_recv().is_ok());

        registry.close("conn-1");
        assert!(!registry.deliver("conn-1", ServerEvent::error(3, "z")));
    }

    #[test]
    fn test_close_unknown_is_noop() {
        let registry = SessionRegistry::new();
        assert!(registry.close("nope").is_none());
    }
}

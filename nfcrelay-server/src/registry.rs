//! Session registry: which clients are associated with which session.

use bytes::Bytes;
use dashmap::DashMap;
use nfcrelay_protocol::{Encoder, SessionId};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use uuid::Uuid;

/// Unique identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A session member: who it is and where its outbound frames go.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: ClientId,
    pub remote_addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
}

impl Member {
    pub fn new(id: ClientId, remote_addr: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            remote_addr,
            outbound,
        }
    }
}

/// How long a broadcast waits on one recipient's full queue by default.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared table of session id to members in join order.
///
/// Every operation is total: unset or unknown sessions are no-ops.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Vec<Member>>,
    send_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets how long a broadcast waits on a recipient whose queue is full.
    /// A recipient that stays full longer is skipped for that broadcast.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Appends `member` to the session, creating it if absent.
    pub fn join(&self, session: Option<SessionId>, member: &Member) {
        let Some(session) = session else {
            return;
        };
        let mut members = self.sessions.entry(session).or_default();
        if !members.iter().any(|m| m.id == member.id) {
            members.push(member.clone());
        }
        tracing::info!(
            "[{}] joined session {} ({} members)",
            member.remote_addr,
            session,
            members.len()
        );
    }

    /// Removes `client` from the session. An emptied session is dropped.
    ///
    /// Returns whether the client was a member.
    pub fn leave(&self, session: Option<SessionId>, client: ClientId) -> bool {
        let Some(session) = session else {
            return false;
        };
        let mut removed = None;
        self.sessions.remove_if_mut(&session, |_, members| {
            if let Some(pos) = members.iter().position(|m| m.id == client) {
                removed = Some(members.remove(pos));
            }
            members.is_empty()
        });
        match removed {
            Some(member) => {
                tracing::info!("[{}] left session {}", member.remote_addr, session);
                true
            }
            None => false,
        }
    }

    /// Delivers `payloads` to every member of the session except
    /// `originator`, in join order.
    ///
    /// The batch is encoded once and queued as a single buffer per
    /// recipient, so two broadcasts never interleave on one recipient. No
    /// lock is held while waiting on a full queue, and each wait is bounded
    /// by the send timeout. Returns the number of recipients.
    pub async fn broadcast(
        &self,
        session: Option<SessionId>,
        originator: ClientId,
        payloads: &[Bytes],
    ) -> usize {
        let Some(session) = session else {
            return 0;
        };
        let recipients: Vec<Member> = match self.sessions.get(&session) {
            Some(members) => members
                .iter()
                .filter(|m| m.id != originator)
                .cloned()
                .collect(),
            None => return 0,
        };
        if recipients.is_empty() || payloads.is_empty() {
            return recipients.len();
        }

        let encoded = match Encoder::encode_batch(payloads) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("session {}: cannot encode batch: {}", session, e);
                return 0;
            }
        };

        for member in &recipients {
            match member
                .outbound
                .send_timeout(encoded.clone(), self.send_timeout)
                .await
            {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => tracing::warn!(
                    "[{}] outbound queue stalled, skipping in session {}",
                    member.remote_addr,
                    session
                ),
                Err(SendTimeoutError::Closed(_)) => tracing::debug!(
                    "[{}] writer gone, skipping in session {}",
                    member.remote_addr,
                    session
                ),
            }
        }
        recipients.len()
    }

    /// Member ids of a session in join order.
    pub fn members(&self, session: SessionId) -> Vec<ClientId> {
        self.sessions
            .get(&session)
            .map(|members| members.iter().map(|m| m.id).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, session: SessionId, client: ClientId) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|members| members.iter().any(|m| m.id == client))
    }

    /// Number of sessions with at least one member.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// Creates a shared registry.
pub fn create_registry() -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new())
}

//! Session negotiation and its collaborators.

use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::ApiTransport;
use crate::egress::Egress;
use crate::worker::{ConnectionState, StateHandle};

/// An authenticated identity for one worker. Bound to exactly one egress
/// for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Subject identifier assigned by the remote.
    pub uid: String,
    /// Opaque remote-assigned fields, carried verbatim.
    pub fields: serde_json::Value,
}

impl Session {
    /// Build a session from the `data` object of a negotiation response.
    /// Returns `None` when the subject identifier is absent, which the
    /// caller treats as a logout signal.
    pub fn from_data(data: &serde_json::Value) -> Option<Self> {
        let uid = match data.get("uid") {
            Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => return None,
        };
        Some(Self {
            uid,
            fields: data.clone(),
        })
    }
}

/// Process-level bearer credential, cleared when the remote signals
/// logout. Reads and writes go through one lock so concurrent
/// negotiations never observe a torn value.
pub struct Credential {
    token: RwLock<Option<String>>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn get(&self) -> Option<String> {
        self.token.read().clone()
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }
}

/// Persistence seam for per-egress sessions. The default implementation
/// is a no-op; the interface exists so a real store can be dropped in.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, egress: &Egress) -> Option<Session>;
    async fn save(&self, egress: &Egress, session: &Session);
}

/// Sink for per-egress status updates, used on logout.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn save_status(&self, egress: &Egress, status: Option<&str>);
}

/// Session store that persists nothing.
pub struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn load(&self, _egress: &Egress) -> Option<Session> {
        None
    }

    async fn save(&self, _egress: &Egress, _session: &Session) {}
}

/// Status sink that records nothing.
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn save_status(&self, _egress: &Egress, _status: Option<&str>) {}
}

/// Result of one negotiation attempt. Negotiation is never retried at
/// this layer; any non-authenticated outcome ends the worker.
#[derive(Debug, Clone)]
pub enum NegotiationOutcome {
    /// A usable session was obtained or restored from the cache.
    Authenticated(Session),
    /// The remote answered well-formed but without a subject id. The
    /// credential has been cleared; not an error.
    LoggedOut,
    /// Transport or protocol failure. `remove_egress` marks the egress
    /// as unusable for future admission.
    Failed { remove_egress: bool },
}

/// Obtain a session for `egress`: resume from the cache when possible,
/// otherwise negotiate with the remote using the process credential.
pub async fn negotiate(
    transport: &dyn ApiTransport,
    session_url: &str,
    egress: &Egress,
    credential: &Credential,
    store: &dyn SessionStore,
    sink: &dyn StatusSink,
    state: &StateHandle,
) -> NegotiationOutcome {
    if let Some(session) = store.load(egress).await {
        info!("Resumed cached session {} for egress {}", session.uid, egress);
        return NegotiationOutcome::Authenticated(session);
    }

    let Some(bearer) = credential.get() else {
        warn!("No credential available, cannot negotiate for egress {}", egress);
        return NegotiationOutcome::Failed { remove_egress: false };
    };

    let response = match transport
        .post_json(session_url, &json!({}), egress, &bearer)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!("Negotiation failed for egress {}: {}", egress, e);
            let remove_egress = e.kind.is_fatal_for_egress();
            if remove_egress {
                info!("Retiring egress {} from future admission", egress);
            }
            return NegotiationOutcome::Failed { remove_egress };
        }
    };

    match Session::from_data(&response.data) {
        Some(session) => {
            store.save(egress, &session).await;
            info!("Negotiated session {} for egress {}", session.uid, egress);
            NegotiationOutcome::Authenticated(session)
        }
        None => {
            // Well-formed answer without a subject id: the account is
            // gone. Clear the credential and reset observable state.
            credential.clear();
            state.set(ConnectionState::NoConnection);
            sink.save_status(egress, None).await;
            info!("Logged out and cleared session info for egress {}", egress);
            NegotiationOutcome::LoggedOut
        }
    }
}

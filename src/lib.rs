//! # heartbeat-pool
//!
//! A bounded pool of proxied workers that keep authenticated sessions
//! alive against a remote service.
//!
//! Each worker is bound to one egress (proxy), negotiates a session over
//! it, and then reports liveness with a periodic ping. Workers fail
//! independently; the pool scheduler detects terminal failures, evicts
//! the worker, and replenishes the pool from an ordered backlog of
//! candidate egresses, keeping the active count at a configured ceiling.

pub mod api;
pub mod config;
pub mod egress;
pub mod error;
pub mod pool;
pub mod session;
mod utils;
pub mod worker;

pub use api::{ApiResponse, ApiTransport, HttpTransport};
pub use config::{PoolConfig, PoolConfigBuilder};
pub use egress::{Egress, EgressValidator, HttpValidator};
pub use error::{StartupError, TransportError, TransportErrorKind};
pub use pool::{Pool, PoolMonitor};
pub use session::{
    Credential, NegotiationOutcome, NoopSessionStore, NoopStatusSink, Session, SessionStore,
    StatusSink,
};
pub use utils::{load_backlog, load_credential};
pub use worker::{ConnectionState, WorkerOutcome};

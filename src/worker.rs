//! Per-worker state and the worker lifecycle task.
//!
//! A worker is bound to exactly one egress. It negotiates a session,
//! then pings forever; ping failures only flip its connection state,
//! never end the task. The task returns only on an unrecoverable
//! negotiation outcome or on cancellation by the scheduler.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::api::ApiTransport;
use crate::config::PoolConfig;
use crate::egress::Egress;
use crate::session::{
    self, Credential, NegotiationOutcome, Session, SessionStore, StatusSink,
};
use crate::utils::unix_timestamp;

/// Observable connection state of one worker. Purely informational; the
/// scheduler never gates decisions on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, before the first successful ping.
    NoConnection = 0,
    /// The last heartbeat reached the remote.
    Connected = 1,
    /// A heartbeat exhausted its retries. Cleared by the next success.
    Disconnected = 2,
}

/// Shared handle to one worker's connection state. The worker writes,
/// the pool's monitor reads.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::NoConnection as u8)))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Relaxed) {
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnected,
            _ => ConnectionState::NoConnection,
        }
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker identity record sent as `browser_id` with every ping.
/// Counters are atomic so the monitor can read them while the worker
/// mutates them in place.
pub struct HeartbeatStats {
    start_time: i64,
    ping_count: AtomicU64,
    successful_pings: AtomicU64,
    score: AtomicU64,
    last_ping_status: Mutex<String>,
    last_ping_time: Mutex<Option<i64>>,
}

impl HeartbeatStats {
    pub fn new() -> Self {
        Self {
            start_time: unix_timestamp(),
            ping_count: AtomicU64::new(0),
            successful_pings: AtomicU64::new(0),
            score: AtomicU64::new(0),
            last_ping_status: Mutex::new("Waiting...".to_string()),
            last_ping_time: Mutex::new(None),
        }
    }

    pub fn record_attempt(&self) {
        self.ping_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, now: i64) {
        self.successful_pings.fetch_add(1, Ordering::Relaxed);
        *self.last_ping_status.lock() = "success".to_string();
        *self.last_ping_time.lock() = Some(now);
    }

    pub fn record_failure(&self, now: i64) {
        *self.last_ping_status.lock() = "failed".to_string();
        *self.last_ping_time.lock() = Some(now);
    }

    pub fn ping_count(&self) -> u64 {
        self.ping_count.load(Ordering::Relaxed)
    }

    pub fn successful_pings(&self) -> u64 {
        self.successful_pings.load(Ordering::Relaxed)
    }

    /// Render the record as the `browser_id` wire object.
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "ping_count": self.ping_count.load(Ordering::Relaxed),
            "successful_pings": self.successful_pings.load(Ordering::Relaxed),
            "score": self.score.load(Ordering::Relaxed),
            "start_time": self.start_time,
            "last_ping_status": self.last_ping_status.lock().clone(),
            "last_ping_time": *self.last_ping_time.lock(),
        })
    }
}

impl Default for HeartbeatStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay before the next ping retry, or `None` once the ceiling is
/// reached and the caller should mark the worker disconnected instead.
pub fn backoff_delay(retries: u32, base: u32, max_retries: u32) -> Option<Duration> {
    if retries >= max_retries {
        None
    } else {
        let secs = u64::from(base).checked_pow(retries).unwrap_or(u64::MAX);
        Some(Duration::from_secs(secs))
    }
}

/// Everything a worker task needs, cloneable per spawn.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<PoolConfig>,
    pub transport: Arc<dyn ApiTransport>,
    pub credential: Arc<Credential>,
    pub store: Arc<dyn SessionStore>,
    pub sink: Arc<dyn StatusSink>,
}

/// Terminal outcome of a worker task. The scheduler replaces workers
/// that end in `Failed` or `LoggedOut`, never cancelled ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Unrecoverable negotiation error. `ban_egress` excludes the
    /// egress from future admission.
    Failed { ban_egress: bool },
    /// The remote signalled logout; not an error.
    LoggedOut,
    /// Torn down by the scheduler.
    Cancelled,
}

/// One logical heartbeat: endpoints are alternates tried in declaration
/// order, sharing one retry counter. Never returns an error; failure is
/// recorded in the connection state.
async fn send_heartbeat(
    ctx: &WorkerContext,
    egress: &Egress,
    session: &Session,
    stats: &HeartbeatStats,
    state: &StateHandle,
) {
    let mut retries: u32 = 0;

    for url in &ctx.config.ping_urls {
        let Some(bearer) = ctx.credential.get() else {
            // A sibling's logout cleared the credential. Nothing is
            // being sent any more, so the observable state must not
            // keep claiming a live connection.
            warn!("Credential cleared, skipping ping for egress {}", egress);
            state.set(ConnectionState::Disconnected);
            return;
        };

        stats.record_attempt();
        let body = json!({
            "id": session.uid,
            "browser_id": stats.snapshot(),
            "timestamp": unix_timestamp(),
        });

        match ctx.transport.post_json(url, &body, egress, &bearer).await {
            Ok(resp) if resp.code == 0 => {
                stats.record_success(unix_timestamp());
                state.set(ConnectionState::Connected);
                info!("Ping successful via egress {} using {}", egress, url);
                return;
            }
            Ok(resp) => {
                warn!(
                    "Ping rejected via egress {} using {}: code {}",
                    egress, url, resp.code
                );
                retries += 1;
                stats.record_failure(unix_timestamp());
                handle_ping_failure(ctx, egress, state, retries).await;
            }
            Err(e) => {
                warn!("Ping failed via egress {} using {}: {}", egress, url, e);
                retries += 1;
                stats.record_failure(unix_timestamp());
                handle_ping_failure(ctx, egress, state, retries).await;
            }
        }
    }
}

async fn handle_ping_failure(
    ctx: &WorkerContext,
    egress: &Egress,
    state: &StateHandle,
    retries: u32,
) {
    match backoff_delay(retries, ctx.config.backoff_base, ctx.config.max_retries) {
        Some(delay) => {
            warn!(
                "Retrying egress {} after attempt {}, backing off for {:?}",
                egress, retries, delay
            );
            tokio::time::sleep(delay).await;
        }
        None => {
            error!("Max retries reached for egress {}, disconnecting", egress);
            state.set(ConnectionState::Disconnected);
        }
    }
}

/// The worker lifecycle task: negotiate, then ping every interval until
/// cancelled. Every suspension point observes the cancellation token.
pub async fn run_worker(
    ctx: WorkerContext,
    egress: Egress,
    state: StateHandle,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let negotiation = tokio::select! {
        _ = cancel.cancelled() => {
            info!("Worker for egress {} cancelled during negotiation", egress);
            return WorkerOutcome::Cancelled;
        }
        outcome = session::negotiate(
            ctx.transport.as_ref(),
            &ctx.config.session_url,
            &egress,
            &ctx.credential,
            ctx.store.as_ref(),
            ctx.sink.as_ref(),
            &state,
        ) => outcome,
    };

    let session = match negotiation {
        NegotiationOutcome::Authenticated(session) => session,
        NegotiationOutcome::LoggedOut => return WorkerOutcome::LoggedOut,
        NegotiationOutcome::Failed { remove_egress } => {
            return WorkerOutcome::Failed {
                ban_egress: remove_egress,
            }
        }
    };

    let stats = HeartbeatStats::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Ping task for egress {} was cancelled", egress);
                return WorkerOutcome::Cancelled;
            }
            _ = send_heartbeat(&ctx, &egress, &session, &stats, &state) => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Ping task for egress {} was cancelled", egress);
                return WorkerOutcome::Cancelled;
            }
            _ = tokio::time::sleep(ctx.config.ping_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{FakeTransport, PendingTransport};
    use crate::api::ApiResponse;
    use crate::error::{TransportError, TransportErrorKind};
    use crate::session::{NoopSessionStore, NoopStatusSink};

    fn context(transport: Arc<dyn ApiTransport>, ping_urls: Vec<&str>) -> WorkerContext {
        let config = PoolConfig::builder("https://remote/session", ping_urls).build();
        WorkerContext {
            config: Arc::new(config),
            transport,
            credential: Arc::new(Credential::new("tok")),
            store: Arc::new(NoopSessionStore),
            sink: Arc::new(NoopStatusSink),
        }
    }

    fn session() -> Session {
        Session {
            uid: "u-1".into(),
            fields: json!({}),
        }
    }

    fn ok(code: i64) -> Result<ApiResponse, TransportError> {
        Ok(ApiResponse {
            code,
            data: json!({}),
        })
    }

    fn err() -> Result<ApiResponse, TransportError> {
        Err(TransportError::new(
            TransportErrorKind::Connect,
            "https://remote/ping",
        ))
    }

    fn session_ok() -> Result<ApiResponse, TransportError> {
        Ok(ApiResponse {
            code: 0,
            data: json!({"uid": "u-1"}),
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn backoff_grows_exponentially_then_stops() {
        assert_eq!(backoff_delay(1, 2, 3), Some(Duration::from_secs(2)));
        assert_eq!(backoff_delay(2, 2, 3), Some(Duration::from_secs(4)));
        assert_eq!(backoff_delay(3, 2, 3), None);
        assert_eq!(backoff_delay(4, 2, 3), None);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        assert_eq!(
            backoff_delay(70, 2, 100),
            Some(Duration::from_secs(u64::MAX))
        );
        assert_eq!(
            backoff_delay(30, u32::MAX, 100),
            Some(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn state_handle_round_trips() {
        let state = StateHandle::new();
        assert_eq!(state.get(), ConnectionState::NoConnection);
        state.set(ConnectionState::Connected);
        assert_eq!(state.get(), ConnectionState::Connected);
        state.set(ConnectionState::Disconnected);
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn successful_ping_connects_and_counts() {
        let transport = Arc::new(FakeTransport::new([ok(0)]));
        let ctx = context(transport.clone(), vec!["https://remote/ping"]);
        let stats = HeartbeatStats::new();
        let state = StateHandle::new();

        send_heartbeat(&ctx, &Egress::new("http://p:1"), &session(), &stats, &state).await;

        assert_eq!(state.get(), ConnectionState::Connected);
        assert_eq!(stats.successful_pings(), 1);
        assert_eq!(stats.ping_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoints_are_tried_in_declaration_order() {
        let transport = Arc::new(FakeTransport::new([ok(1), ok(0)]));
        let ctx = context(
            transport.clone(),
            vec!["https://first/ping", "https://second/ping"],
        );
        let stats = HeartbeatStats::new();
        let state = StateHandle::new();

        send_heartbeat(&ctx, &Egress::new("http://p:1"), &session(), &stats, &state).await;

        assert_eq!(
            transport.calls.lock().as_slice(),
            &["https://first/ping", "https://second/ping"]
        );
        assert_eq!(state.get(), ConnectionState::Connected);
        assert_eq!(stats.successful_pings(), 1);
        assert_eq!(stats.ping_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_disconnect_without_ending_the_loop() {
        let transport = Arc::new(FakeTransport::new([err(), err(), err()]));
        let ctx = context(
            transport.clone(),
            vec!["https://a/ping", "https://b/ping", "https://c/ping"],
        );
        let stats = HeartbeatStats::new();
        let state = StateHandle::new();

        send_heartbeat(&ctx, &Egress::new("http://p:1"), &session(), &stats, &state).await;

        assert_eq!(state.get(), ConnectionState::Disconnected);
        assert_eq!(stats.successful_pings(), 0);
        assert_eq!(stats.ping_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_recovers_on_next_successful_ping() {
        let transport = Arc::new(FakeTransport::new([err(), err(), err(), ok(0)]));
        let ctx = context(
            transport.clone(),
            vec!["https://a/ping", "https://b/ping", "https://c/ping"],
        );
        let stats = HeartbeatStats::new();
        let state = StateHandle::new();
        let egress = Egress::new("http://p:1");

        send_heartbeat(&ctx, &egress, &session(), &stats, &state).await;
        assert_eq!(state.get(), ConnectionState::Disconnected);

        send_heartbeat(&ctx, &egress, &session(), &stats, &state).await;
        assert_eq!(state.get(), ConnectionState::Connected);
        assert_eq!(stats.successful_pings(), 1);
    }

    #[tokio::test]
    async fn cleared_credential_skips_the_ping_and_disconnects() {
        let transport = Arc::new(FakeTransport::new([ok(0)]));
        let ctx = context(transport.clone(), vec!["https://remote/ping"]);
        ctx.credential.clear();
        let stats = HeartbeatStats::new();
        let state = StateHandle::new();
        // A worker that was connected must not keep claiming so once
        // nothing is being sent any more.
        state.set(ConnectionState::Connected);

        send_heartbeat(&ctx, &Egress::new("http://p:1"), &session(), &stats, &state).await;

        assert!(transport.calls.lock().is_empty());
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn first_ping_is_immediate_and_the_next_waits_the_interval() {
        let transport = Arc::new(FakeTransport::new([session_ok(), ok(0), ok(0)]));
        let ctx = context(transport.clone(), vec!["https://remote/ping"]);
        let cancel = CancellationToken::new();
        let state = StateHandle::new();
        let handle = tokio::spawn(run_worker(
            ctx,
            Egress::new("http://p:1"),
            state.clone(),
            cancel.clone(),
        ));

        // Negotiation plus the immediate first ping, no clock movement.
        settle().await;
        assert_eq!(transport.calls.lock().len(), 2);
        assert_eq!(state.get(), ConnectionState::Connected);

        // One second short of the interval nothing new is sent.
        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(transport.calls.lock().len(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(transport.calls.lock().len(), 3);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), WorkerOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_worker_waits_the_full_interval_before_its_next_heartbeat() {
        let transport = Arc::new(FakeTransport::new([session_ok(), err(), err(), err(), ok(0)]));
        let ctx = context(
            transport.clone(),
            vec!["https://a/ping", "https://b/ping", "https://c/ping"],
        );
        let cancel = CancellationToken::new();
        let state = StateHandle::new();
        let handle = tokio::spawn(run_worker(
            ctx,
            Egress::new("http://p:1"),
            state.clone(),
            cancel.clone(),
        ));

        // Negotiation and the first endpoint attempt; the worker is now
        // backing off for 2s.
        settle().await;
        assert_eq!(transport.calls.lock().len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(transport.calls.lock().len(), 3);

        // The third failure hits the retry ceiling: disconnected, and
        // no further attempt until the regular interval elapses.
        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(transport.calls.lock().len(), 4);
        assert_eq!(state.get(), ConnectionState::Disconnected);

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(transport.calls.lock().len(), 4);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(transport.calls.lock().len(), 5);
        assert_eq!(state.get(), ConnectionState::Connected);

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), WorkerOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancellation_ends_the_worker_with_cancelled_outcome() {
        let ctx = context(Arc::new(PendingTransport), vec!["https://remote/ping"]);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_worker(
            ctx,
            Egress::new("http://p:1"),
            StateHandle::new(),
            cancel.clone(),
        ));

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), WorkerOutcome::Cancelled);
    }

    #[tokio::test]
    async fn logout_ends_the_worker_as_logged_out() {
        let transport = Arc::new(FakeTransport::new([ok(0)]));
        let ctx = context(transport, vec!["https://remote/ping"]);

        let outcome = run_worker(
            ctx,
            Egress::new("http://p:1"),
            StateHandle::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, WorkerOutcome::LoggedOut);
    }

    #[tokio::test]
    async fn fatal_negotiation_failure_bans_the_egress() {
        let transport = Arc::new(FakeTransport::new([Err(TransportError::new(
            TransportErrorKind::ServerError(500),
            "https://remote/session",
        ))]));
        let ctx = context(transport, vec!["https://remote/ping"]);

        let outcome = run_worker(
            ctx,
            Egress::new("http://p:1"),
            StateHandle::new(),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, WorkerOutcome::Failed { ban_egress: true });
    }
}

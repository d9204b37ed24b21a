//! The pool scheduler.
//!
//! Owns the backlog of candidate egresses, the set of running worker
//! tasks, and the admission/eviction/replenishment loop that keeps the
//! active worker count at the configured ceiling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use log::{error, info, warn};
use parking_lot::RwLock;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiTransport, HttpTransport};
use crate::config::PoolConfig;
use crate::egress::{Egress, EgressValidator, HttpValidator};
use crate::session::{Credential, NoopSessionStore, NoopStatusSink, SessionStore, StatusSink};
use crate::worker::{run_worker, ConnectionState, StateHandle, WorkerContext, WorkerOutcome};

/// A bounded pool of workers, each bound to a distinct egress.
pub struct Pool {
    config: Arc<PoolConfig>,
    ctx: WorkerContext,
    validator: Arc<dyn EgressValidator>,
    /// Ordered candidates not yet admitted.
    backlog: VecDeque<Egress>,
    /// Running task handle -> its bound egress.
    active: HashMap<Id, Egress>,
    tasks: JoinSet<WorkerOutcome>,
    /// Per-egress connection state, shared with [`PoolMonitor`].
    states: Arc<RwLock<HashMap<Egress, StateHandle>>>,
    /// Egresses retired by a fatal negotiation failure.
    banned: HashSet<Egress>,
    shutdown: CancellationToken,
}

impl Pool {
    /// Create a pool with the default HTTP transport and validator and
    /// no-op persistence collaborators.
    pub fn new(config: PoolConfig, bearer_token: impl Into<String>, backlog: Vec<Egress>) -> Self {
        let transport = Arc::new(HttpTransport::new(&config));
        let validator = Arc::new(HttpValidator::new(
            config.validate_url.clone(),
            config.validate_timeout,
        ));
        Self::with_collaborators(
            config,
            bearer_token,
            backlog,
            transport,
            validator,
            Arc::new(NoopSessionStore),
            Arc::new(NoopStatusSink),
        )
    }

    /// Create a pool with explicit collaborators. This is the seam for
    /// real session persistence and for tests.
    pub fn with_collaborators(
        config: PoolConfig,
        bearer_token: impl Into<String>,
        backlog: Vec<Egress>,
        transport: Arc<dyn ApiTransport>,
        validator: Arc<dyn EgressValidator>,
        store: Arc<dyn SessionStore>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let config = Arc::new(config);
        let ctx = WorkerContext {
            config: Arc::clone(&config),
            transport,
            credential: Arc::new(Credential::new(bearer_token)),
            store,
            sink,
        };
        Self {
            config,
            ctx,
            validator,
            backlog: backlog.into(),
            active: HashMap::new(),
            tasks: JoinSet::new(),
            states: Arc::new(RwLock::new(HashMap::new())),
            banned: HashSet::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Read-only observer of per-worker connection state. Remains valid
    /// while the pool runs.
    pub fn monitor(&self) -> PoolMonitor {
        PoolMonitor {
            states: Arc::clone(&self.states),
        }
    }

    /// Token that stops the pool when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the pool until the shutdown token fires, then tear down all
    /// workers and return.
    pub async fn run(mut self) {
        self.admit_initial().await;
        info!(
            "Pool started with {}/{} active workers, {} candidates in backlog",
            self.active.len(),
            self.config.max_connections,
            self.backlog.len()
        );

        while self.step().await {}

        self.drain().await;
        info!("Pool shut down");
    }

    /// One scheduler iteration. Returns `false` once shutdown fired.
    async fn step(&mut self) -> bool {
        // Wait for the first completed worker so one slow task never
        // stalls the pool.
        let first = tokio::select! {
            _ = self.shutdown.cancelled() => return false,
            joined = self.tasks.join_next_with_id() => joined,
        };
        if let Some(res) = first {
            self.reap(res).await;
        }
        // Collect any siblings that finished in the meantime, without
        // blocking on the still-running ones.
        while let Some(Some(res)) = self.tasks.join_next_with_id().now_or_never() {
            self.reap(res).await;
        }

        self.top_up().await;

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.config.scheduler_pause) => true,
        }
    }

    /// Fill the pool from the backlog head at startup, validating each
    /// batch of candidates concurrently but admitting in backlog order.
    async fn admit_initial(&mut self) {
        while self.active.len() < self.config.max_connections && !self.backlog.is_empty() {
            let want = self.config.max_connections - self.active.len();
            let mut batch = Vec::with_capacity(want);
            while batch.len() < want {
                match self.next_candidate() {
                    Some(candidate) => batch.push(candidate),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }

            let validator = Arc::clone(&self.validator);
            let checks = batch.into_iter().map(move |egress| {
                let validator = Arc::clone(&validator);
                async move {
                    let usable = validator.validate(&egress).await;
                    (egress, usable)
                }
            });
            let results = join_all(checks).await;
            for (egress, usable) in results {
                if usable {
                    self.spawn_worker(egress);
                } else {
                    warn!("Candidate egress {} failed validation, skipping", egress);
                }
            }
        }
    }

    /// Handle one completed worker task: drop it from the active set and
    /// replace it unless it was deliberately cancelled.
    async fn reap(&mut self, res: Result<(Id, WorkerOutcome), JoinError>) {
        let (id, outcome) = match res {
            Ok(pair) => pair,
            Err(e) if e.is_cancelled() => (e.id(), WorkerOutcome::Cancelled),
            Err(e) => {
                error!("Worker task panicked: {}", e);
                (e.id(), WorkerOutcome::Failed { ban_egress: false })
            }
        };
        let Some(egress) = self.active.remove(&id) else {
            return;
        };
        self.states.write().remove(&egress);

        match outcome {
            WorkerOutcome::Cancelled => {
                info!("Worker for egress {} was cancelled", egress);
            }
            WorkerOutcome::LoggedOut => {
                info!("Worker for egress {} logged out, replacing", egress);
                self.admit_next().await;
            }
            WorkerOutcome::Failed { ban_egress } => {
                if ban_egress {
                    self.banned.insert(egress.clone());
                }
                warn!("Removing and replacing failed egress {}", egress);
                self.admit_next().await;
            }
        }
    }

    /// Admit further candidates while below the ceiling.
    async fn top_up(&mut self) {
        while self.active.len() < self.config.max_connections && !self.backlog.is_empty() {
            self.admit_next().await;
        }
    }

    /// Pull the next backlog candidate through the validator and admit
    /// it on success. At most one candidate is probed per call; a failed
    /// probe discards the candidate without retry.
    async fn admit_next(&mut self) -> bool {
        if self.shutdown.is_cancelled() || self.active.len() >= self.config.max_connections {
            return false;
        }
        let Some(candidate) = self.next_candidate() else {
            return false;
        };
        if self.validator.validate(&candidate).await {
            self.spawn_worker(candidate);
            true
        } else {
            warn!("Candidate egress {} failed validation, skipping", candidate);
            false
        }
    }

    fn next_candidate(&mut self) -> Option<Egress> {
        while let Some(candidate) = self.backlog.pop_front() {
            if self.banned.contains(&candidate) {
                info!("Skipping retired egress {}", candidate);
                continue;
            }
            return Some(candidate);
        }
        None
    }

    fn spawn_worker(&mut self, egress: Egress) {
        let state = StateHandle::new();
        self.states.write().insert(egress.clone(), state.clone());

        let ctx = self.ctx.clone();
        let cancel = self.shutdown.child_token();
        let task_egress = egress.clone();
        let handle = self
            .tasks
            .spawn(run_worker(ctx, task_egress, state, cancel));
        info!("Admitted egress {} to the pool", egress);
        self.active.insert(handle.id(), egress);
    }

    /// Cancel every worker and wait for all of them to return.
    async fn drain(&mut self) {
        info!("Stopping {} active workers", self.active.len());
        self.shutdown.cancel();
        while let Some(res) = self.tasks.join_next_with_id().await {
            self.reap(res).await;
        }
    }
}

/// Read-only snapshot access to the pool's per-worker connection state.
#[derive(Clone)]
pub struct PoolMonitor {
    states: Arc<RwLock<HashMap<Egress, StateHandle>>>,
}

impl PoolMonitor {
    /// Current connection state of every active worker.
    pub fn snapshot(&self) -> Vec<(Egress, ConnectionState)> {
        self.states
            .read()
            .iter()
            .map(|(egress, state)| (egress.clone(), state.get()))
            .collect()
    }

    /// (active, connected) worker counts.
    pub fn stats(&self) -> (usize, usize) {
        let states = self.states.read();
        let connected = states
            .values()
            .filter(|s| s.get() == ConnectionState::Connected)
            .count();
        (states.len(), connected)
    }
}

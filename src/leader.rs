use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use kubert::lease::{ClaimParams, LeaseManager};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use kubert::lease::Claim;

use crate::error::{LeaseError, StoreError};
use crate::metrics;
use crate::retry;

/* ============================= CONFIG ============================= */

const FIELD_MANAGER: &str = "kyverno-plugin";

/// How long a stopping session may take to observe its token before the
/// task is aborted.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Bound on vacating the lease during shutdown.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
    pub release_on_cancel: bool,
}

impl ElectionConfig {
    /// The claim is renewed once `retry_period` has passed since the last
    /// renewal, leaving the rest of the lease as grace.
    pub fn claim_params(&self) -> ClaimParams {
        ClaimParams {
            lease_duration: self.lease_duration,
            renew_grace_period: self.lease_duration.saturating_sub(self.retry_period),
        }
    }
}

/* ============================= LEASE ============================= */

pub type Claims = watch::Receiver<Arc<Claim>>;

/// Stream of lease claims produced by a background kubert task.
pub struct LeaseSession {
    pub claims: Claims,
    task: JoinHandle<Result<(), kubert::lease::Error>>,
}

impl LeaseSession {
    /// Make sure the Lease exists, then start claiming it as
    /// `config.identity`.
    pub async fn start(client: Client, config: &ElectionConfig) -> Result<Self, LeaseError> {
        let api: Api<Lease> = Api::namespaced(client, &config.namespace);
        ensure_lease(&api, config).await?;

        let (claims, task) = LeaseManager::init(api, &config.lease_name)
            .await?
            .spawn(&config.identity, config.claim_params())
            .await?;

        info!(lease = %config.lease_name, identity = %config.identity, "lease_claims_started");
        Ok(Self { claims, task })
    }

    /// Stop claiming. With `vacate` the claim task gives the lease up once
    /// its receiver is gone; otherwise it is aborted and the lease runs out.
    pub async fn close(self, vacate: bool) {
        let Self { claims, task } = self;

        if !vacate {
            task.abort();
            drop(claims);
            debug!("lease_left_to_expire");
            return;
        }

        drop(claims);
        match timeout(RELEASE_TIMEOUT, task).await {
            Ok(Ok(Ok(()))) => info!("lease_released"),
            Ok(Ok(Err(e))) => warn!(error = %e, "lease_release_failed"),
            Ok(Err(e)) => warn!(error = %e, "lease_task_join_failed"),
            Err(_) => warn!("lease_release_timed_out"),
        }
    }
}

/// Create the Lease if it does not exist yet. A resourceVersion of "0"
/// makes the apply a create-only call.
async fn ensure_lease(api: &Api<Lease>, config: &ElectionConfig) -> Result<(), LeaseError> {
    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(config.lease_name.clone()),
            namespace: Some(config.namespace.clone()),
            resource_version: Some("0".to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec::default()),
    };
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };

    let name = config.lease_name.as_str();
    let (params, patch) = (&params, &Patch::Apply(lease));
    match retry::kube(move || async move { Ok(api.patch(name, params, patch).await?) }).await {
        Ok(_) => info!(lease = %name, "lease_created"),
        Err(StoreError::Conflict(_)) => debug!(lease = %name, "lease_exists"),
        Err(e) => return Err(LeaseError::Create(e)),
    }
    Ok(())
}

/* ============================= ELECTOR ============================= */

/// Callbacks driven by the elector.
#[async_trait]
pub trait LeadershipHandler: Send + Sync {
    async fn on_started_leading(&self);
    async fn on_stopped_leading(&self);
    /// Called whenever the observed holder changes, including to ourselves.
    async fn on_new_leader(&self, identity: &str);
}

/// Turns lease claims into leadership transitions.
///
/// Leadership is held while the latest claim names this identity and has
/// been renewed within `renew_deadline`. A claim that stops being renewed
/// drops leadership at the deadline even if the lease itself has not
/// expired yet.
pub struct LeaderElector {
    identity: String,
    lease_duration: Duration,
    renew_deadline: Duration,
}

impl LeaderElector {
    pub fn new(config: &ElectionConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
        }
    }

    /// Instant by which `claim` must be renewed, or `None` if it does not
    /// make us leader.
    fn leading_until(&self, claim: &Claim) -> Option<Instant> {
        if claim.holder != self.identity {
            return None;
        }

        // a claim is written with expiry = renewal + lease_duration
        let remaining = (claim.expiry - Utc::now()).to_std().ok()?;
        let margin = self.lease_duration.saturating_sub(self.renew_deadline);
        let left = remaining.checked_sub(margin)?;

        Some(Instant::now() + left)
    }

    /// Follow `claims` until `stop` fires. Returns `ClaimsClosed` if the
    /// claim task goes away first.
    pub async fn run(
        &self,
        claims: &mut Claims,
        handler: &dyn LeadershipHandler,
        stop: CancellationToken,
    ) -> Result<(), LeaseError> {
        let mut observed: Option<String> = None;
        let mut leading = false;
        let mut result = Ok(());

        info!(identity = %self.identity, "leader_election_started");

        let mut claim = claims.borrow_and_update().clone();
        let mut deadline = self.leading_until(&claim);

        loop {
            if !claim.holder.is_empty() && observed.as_deref() != Some(claim.holder.as_str()) {
                observed = Some(claim.holder.clone());
                handler.on_new_leader(&claim.holder).await;
            }

            match (leading, deadline.is_some()) {
                (false, true) => {
                    leading = true;
                    metrics::LEADER.set(1);
                    info!(identity = %self.identity, "leader_acquired");
                    handler.on_started_leading().await;
                }
                (true, false) => {
                    leading = false;
                    metrics::LEADER.set(0);
                    warn!(holder = %claim.holder, "leader_lost");
                    handler.on_stopped_leading().await;
                }
                _ => {}
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                changed = claims.changed() => {
                    if changed.is_err() {
                        warn!("lease_claims_closed");
                        result = Err(LeaseError::ClaimsClosed);
                        break;
                    }
                    claim = claims.borrow_and_update().clone();
                    deadline = self.leading_until(&claim);
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(renew_deadline_secs = self.renew_deadline.as_secs(), "leader_renew_deadline_exceeded");
                    deadline = None;
                }
            }
        }

        if leading {
            metrics::LEADER.set(0);
            handler.on_stopped_leading().await;
        }

        info!("leader_election_stopped");
        result
    }
}

/// Claim the lease and run `task` under it until `stop` fires.
pub async fn run_elected(
    client: Client,
    config: &ElectionConfig,
    task: GatedTask,
    stop: CancellationToken,
) -> Result<(), LeaseError> {
    let mut session = LeaseSession::start(client, config).await?;
    let coordinator = Coordinator::new(config.identity.clone(), task, stop.clone());

    let result = LeaderElector::new(config)
        .run(&mut session.claims, &coordinator, stop)
        .await;
    session.close(config.release_on_cancel).await;
    result
}

/* ============================= COORDINATOR ============================= */

/// The loop that may only run on the leader. It must return once its
/// token is cancelled.
pub type GatedTask = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn gated<F, Fut>(f: F) -> GatedTask
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |token| Box::pin(f(token)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Starting,
    Running,
    Stopping,
}

struct Session {
    state: State,
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
    started: u64,
}

/// Starts the gated task on leadership gain and tears it down on loss.
/// Every session gets its own cancellation token.
pub struct Coordinator {
    identity: String,
    task: GatedTask,
    parent: CancellationToken,
    stop_grace: Duration,
    session: Mutex<Session>,
}

impl Coordinator {
    pub fn new(identity: impl Into<String>, task: GatedTask, parent: CancellationToken) -> Self {
        Self {
            identity: identity.into(),
            task,
            parent,
            stop_grace: STOP_GRACE,
            session: Mutex::new(Session {
                state: State::Idle,
                token: None,
                handle: None,
                started: 0,
            }),
        }
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub async fn state(&self) -> State {
        self.session.lock().await.state
    }

    /// Number of sessions started so far.
    pub async fn sessions_started(&self) -> u64 {
        self.session.lock().await.started
    }

    async fn start(&self) {
        let mut session = self.session.lock().await;
        if session.state != State::Idle {
            warn!(state = ?session.state, "gated_loop_already_active");
            return;
        }

        session.state = State::Starting;
        let token = self.parent.child_token();
        session.handle = Some(tokio::spawn((self.task)(token.clone())));
        session.token = Some(token);
        session.started += 1;
        session.state = State::Running;

        info!(session = session.started, "gated_loop_started");
    }

    /// Cancel the running session and wait up to `stop_grace` for it to
    /// finish. A task that ignores its token is aborted.
    async fn stop(&self) {
        let (token, handle, number) = {
            let mut session = self.session.lock().await;
            if session.state != State::Running {
                return;
            }
            session.state = State::Stopping;
            (session.token.take(), session.handle.take(), session.started)
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(mut handle) = handle {
            match timeout(self.stop_grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "gated_loop_join_failed"),
                Err(_) => {
                    warn!(session = number, grace_secs = self.stop_grace.as_secs(), "gated_loop_aborted");
                    handle.abort();
                    if let Err(e) = handle.await
                        && !e.is_cancelled()
                    {
                        warn!(error = %e, "gated_loop_join_failed");
                    }
                }
            }
        }

        self.session.lock().await.state = State::Idle;
        info!(session = number, "gated_loop_stopped");
    }
}

#[async_trait]
impl LeadershipHandler for Coordinator {
    async fn on_started_leading(&self) {
        self.start().await;
    }

    async fn on_stopped_leading(&self) {
        self.stop().await;
    }

    async fn on_new_leader(&self, identity: &str) {
        if identity == self.identity {
            debug!(identity = %identity, "still_leader");
        } else {
            info!(leader = %identity, "new_leader_elected");
        }
    }
}

/// Leader election disabled: run the task exactly once for the process
/// lifetime.
pub async fn run_unconditionally(task: GatedTask, stop: CancellationToken) {
    info!("leader_election_disabled");
    task(stop).await;
}

/* ============================= TESTS ============================= */

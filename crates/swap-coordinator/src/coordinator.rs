use crate::events::{CloseReason, CoordinatorEvent};
use crate::remote::{self, PushChannel, ProposalRemote};
use crate::supervisor::{run_with_timeout, AttemptFailure, RunOutcome, SupervisorHooks};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use swap_core::config::CoordinatorConfig;
use swap_core::connection::ConnectionHealth;
use swap_core::diagnostics::DiagnosticSnapshot;
use swap_core::optimistic::OptimisticUpdates;
use swap_core::policy::RetryPolicy;
use swap_core::reconcile::{reconcile, Reconciliation};
use swap_core::session::{ActionSession, SessionEvent, SessionState, StateChange};
use swap_core::view::{ProposalView, ViewModel};
use swap_core::watchdog::{StuckDetector, StuckSignal};
use swap_core::{
    ActionType, OperationKind, ProposalId, PushUpdate, RemoteError, Result, SwapError,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fired once when a session reaches `Succeeded`.
pub type SuccessCallback = Box<dyn FnOnce(&ProposalId) + Send>;

const EVENT_CAPACITY: usize = 512;

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

pub struct Intent {
    pub proposal_id: ProposalId,
    pub action: ActionType,
    pub reason: Option<String>,
    on_success: Option<SuccessCallback>,
}

impl Intent {
    pub fn new(proposal_id: impl Into<ProposalId>, action: ActionType) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            action,
            reason: None,
            on_success: None,
        }
    }

    pub fn accept(proposal_id: impl Into<ProposalId>) -> Self {
        Self::new(proposal_id, ActionType::Accept)
    }

    pub fn reject(proposal_id: impl Into<ProposalId>) -> Self {
        Self::new(proposal_id, ActionType::Reject)
    }

    /// Free-text reason; only kept for `reject`.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce(&ProposalId) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Intent")
            .field("proposal_id", &self.proposal_id)
            .field("action", &self.action)
            .field("reason", &self.reason)
            .field("on_success", &self.on_success.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentAccepted {
    pub session_id: Uuid,
    pub state: SessionState,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Entry {
    session: ActionSession,
    /// Stops the driver of the current submission cycle.
    cancel: CancellationToken,
    on_success: Option<SuccessCallback>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<ProposalId, Entry>,
    view: ViewModel,
    optimistic: OptimisticUpdates,
    last_submission: HashMap<ProposalId, Instant>,
    direct: HashSet<ProposalId>,
}

impl Registry {
    /// The entry a driver belongs to, if it is still the live, non-terminal one.
    fn current(&mut self, id: &ProposalId, session_id: Uuid, epoch: u64) -> Option<&mut Entry> {
        self.sessions.get_mut(id).filter(|e| {
            e.session.id == session_id && e.session.epoch == epoch && !e.session.is_terminal()
        })
    }

    fn rollback(&mut self, id: &ProposalId) -> bool {
        let Some(snapshot) = self
            .sessions
            .get_mut(id)
            .and_then(|e| e.session.optimistic_snapshot.take())
        else {
            return false;
        };
        self.optimistic.rollback(&mut self.view, id, &snapshot)
    }

    /// Forget debounce stamps that can no longer block anything.
    fn prune_stamps(&mut self, now: Instant, window: Duration) {
        self.last_submission
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    fn confirm_optimistic(&mut self, id: &ProposalId) {
        if let Some(entry) = self.sessions.get_mut(id) {
            entry.session.optimistic_snapshot = None;
        }
        self.optimistic.confirm(id);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Inner {
    config: CoordinatorConfig,
    remote: Arc<dyn ProposalRemote>,
    channel: Option<Arc<dyn PushChannel>>,
    detector: StuckDetector,
    registry: Mutex<Registry>,
    events: broadcast::Sender<CoordinatorEvent>,
    shutdown: CancellationToken,
}

/// Owns every action session and the shared view model. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        remote: Arc<dyn ProposalRemote>,
        channel: Option<Arc<dyn PushChannel>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                detector: StuckDetector::new(config.max_loading_time()),
                config,
                remote,
                channel,
                registry: Mutex::new(Registry::default()),
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Presentation-facing operations
    // -----------------------------------------------------------------------

    /// Start a session for `intent`. Rejected while the proposal has a
    /// non-terminal session or inside the debounce window.
    pub async fn user_intent(&self, intent: Intent) -> Result<IntentAccepted> {
        let Intent {
            proposal_id: id,
            action,
            reason,
            on_success,
        } = intent;
        let now = Instant::now();

        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;

        if let Some(entry) = reg.sessions.get(&id) {
            if !entry.session.is_terminal() {
                warn!(proposal = %id, state = %entry.session.state, "user_intent: action already in progress");
                self.ignored(&id, "an action is already in progress");
                return Err(SwapError::SessionInFlight(id));
            }
        }
        if reg.direct.contains(&id) {
            warn!(proposal = %id, "user_intent: direct submission in progress");
            self.ignored(&id, "a direct submission is in progress");
            return Err(SwapError::SessionInFlight(id));
        }
        self.check_debounce(reg, &id, now)?;

        let requires_confirmation = self.inner.config.requires_confirmation(action);
        let policy = self.inner.config.policy_for(action.operation());
        let session = ActionSession::new(
            id.clone(),
            action,
            reason,
            policy.max_attempts,
            requires_confirmation,
            now.into_std(),
        );
        let accepted = IntentAccepted {
            session_id: session.id,
            state: session.state,
        };

        let replaced = reg.sessions.insert(
            id.clone(),
            Entry {
                session,
                cancel: self.inner.shutdown.child_token(),
                on_success,
            },
        );
        if let Some(old) = replaced {
            old.cancel.cancel();
            debug!(proposal = %id, previous = %old.session.state, "user_intent: replacing terminal session");
        }

        info!(proposal = %id, %action, state = %accepted.state, "user_intent: session started");
        self.emit(CoordinatorEvent::SessionStarted {
            proposal_id: id.clone(),
            session_id: accepted.session_id,
            action,
            state: accepted.state,
        });

        if accepted.state == SessionState::OptimisticallyApplied {
            self.begin_submission(reg, &id, now);
        }
        Ok(accepted)
    }

    pub async fn confirm(&self, id: &ProposalId) -> Result<SessionState> {
        let now = Instant::now();
        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;
        let entry = reg
            .sessions
            .get_mut(id)
            .ok_or_else(|| SwapError::SessionNotFound(id.clone()))?;
        self.step(&mut entry.session, SessionEvent::Confirm, now)?;
        self.begin_submission(reg, id, now);
        Ok(SessionState::OptimisticallyApplied)
    }

    /// Decline the confirmation prompt. Only valid before anything was sent.
    pub async fn cancel(&self, id: &ProposalId) -> Result<()> {
        let now = Instant::now();
        let mut guard = self.inner.registry.lock().await;
        let entry = guard
            .sessions
            .get_mut(id)
            .ok_or_else(|| SwapError::SessionNotFound(id.clone()))?;
        if self.step(&mut entry.session, SessionEvent::Cancel, now)? == StateChange::Discarded {
            guard.sessions.remove(id);
            info!(proposal = %id, "cancel: session discarded");
            self.emit(CoordinatorEvent::SessionClosed {
                proposal_id: id.clone(),
                reason: CloseReason::Cancelled,
            });
        }
        Ok(())
    }

    /// Manual retry of a terminally failed session. Goes back through
    /// confirmation when the action requires it; otherwise submits again.
    pub async fn retry_requested(&self, id: &ProposalId) -> Result<SessionState> {
        let now = Instant::now();
        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;
        if !reg.sessions.contains_key(id) {
            return Err(SwapError::SessionNotFound(id.clone()));
        }
        if reg.direct.contains(id) {
            warn!(proposal = %id, "retry_requested: direct submission in progress");
            self.ignored(id, "a direct submission is in progress");
            return Err(SwapError::SessionInFlight(id.clone()));
        }
        self.check_debounce(reg, id, now)?;

        let entry = reg
            .sessions
            .get_mut(id)
            .ok_or_else(|| SwapError::SessionNotFound(id.clone()))?;
        self.step(&mut entry.session, SessionEvent::RetryRequested, now)?;

        if self.inner.config.requires_confirmation(entry.session.action_type) {
            return Ok(SessionState::Confirming);
        }
        self.step(&mut entry.session, SessionEvent::Confirm, now)?;
        self.begin_submission(reg, id, now);
        Ok(SessionState::OptimisticallyApplied)
    }

    /// Drop a terminal session once nothing displays it any more.
    pub async fn dismiss(&self, id: &ProposalId) -> Result<()> {
        let mut guard = self.inner.registry.lock().await;
        match guard.sessions.get(id) {
            None => return Err(SwapError::SessionNotFound(id.clone())),
            Some(entry) if !entry.session.is_terminal() => {
                return Err(SwapError::SessionInFlight(id.clone()))
            }
            Some(_) => {}
        }
        guard.sessions.remove(id);
        guard.prune_stamps(Instant::now(), self.inner.config.debounce());
        debug!(proposal = %id, "dismiss: session removed");
        self.emit(CoordinatorEvent::SessionClosed {
            proposal_id: id.clone(),
            reason: CloseReason::Dismissed,
        });
        Ok(())
    }

    /// Manual fallback: one supervised attempt outside the optimistic path.
    /// The view is written only after the remote confirmed.
    pub async fn direct_submit(
        &self,
        id: &ProposalId,
        action: ActionType,
        reason: Option<String>,
    ) -> Result<RunOutcome<()>> {
        let now = Instant::now();
        {
            let mut guard = self.inner.registry.lock().await;
            if guard
                .sessions
                .get(id)
                .is_some_and(|e| !e.session.is_terminal())
                || guard.direct.contains(id)
            {
                warn!(proposal = %id, "direct_submit: action already in progress");
                return Err(SwapError::SessionInFlight(id.clone()));
            }
            guard.direct.insert(id.clone());
            guard.last_submission.insert(id.clone(), now);
        }

        info!(proposal = %id, %action, "direct_submit: submitting");
        let policy = RetryPolicy::single(self.inner.config.timeout_for(action.operation()));
        let remote = self.inner.remote.clone();
        let cancel = self.inner.shutdown.child_token();
        let outcome = run_with_timeout(
            |_| {
                let remote = remote.clone();
                let id = id.clone();
                let reason = reason.clone();
                async move { remote::submit(&*remote, &id, action, reason.as_deref()).await }
            },
            &policy,
            &(),
            &cancel,
        )
        .await;

        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;
        reg.direct.remove(id);
        if outcome.success() {
            info!(proposal = %id, %action, "direct_submit: confirmed by remote");
            reg.view
                .set(id, ProposalView::new(action.expected_status(), Utc::now()));
            if reg.sessions.get(id).is_some_and(|e| e.session.is_terminal()) {
                reg.sessions.remove(id);
                self.emit(CoordinatorEvent::SessionClosed {
                    proposal_id: id.clone(),
                    reason: CloseReason::Superseded,
                });
            }
            self.flush_view(reg);
        } else if let Some(failure) = &outcome.error {
            warn!(proposal = %id, category = %failure.classification.category, error = %failure.error, "direct_submit: failed");
        }
        self.emit(CoordinatorEvent::DirectSubmitFinished {
            proposal_id: id.clone(),
            action,
            success: outcome.success(),
            classification: outcome.error.as_ref().map(|f| f.classification.clone()),
        });
        Ok(outcome)
    }

    /// Manual recovery for a stuck or failed session: stop its driver, undo
    /// the optimistic change, forget the session and refetch. The original
    /// mutation is never retried here.
    pub async fn recover(&self, id: &ProposalId) -> Result<RunOutcome<()>> {
        {
            let mut guard = self.inner.registry.lock().await;
            let reg = &mut *guard;
            let entry = reg
                .sessions
                .get(id)
                .ok_or_else(|| SwapError::SessionNotFound(id.clone()))?;
            entry.cancel.cancel();
            let state = entry.session.state;

            if reg.rollback(id) {
                self.emit(CoordinatorEvent::RolledBack {
                    proposal_id: id.clone(),
                });
            }
            reg.sessions.remove(id);
            reg.prune_stamps(Instant::now(), self.inner.config.debounce());
            self.flush_view(reg);
            warn!(proposal = %id, %state, "recover: session reset");
            self.emit(CoordinatorEvent::SessionClosed {
                proposal_id: id.clone(),
                reason: CloseReason::Recovered,
            });
        }
        Ok(self.run_refresh(id, false).await)
    }

    // -----------------------------------------------------------------------
    // Push feed
    // -----------------------------------------------------------------------

    /// Apply one push update. Updates for the same proposal must be fed in
    /// arrival order.
    pub async fn handle_push(&self, update: PushUpdate) -> Reconciliation {
        let now = Instant::now();
        let id = update.proposal_id.clone();
        let mut callback = None;

        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;
        let decision = reconcile(
            reg.sessions.get(&id).map(|e| &e.session),
            reg.view.get(&id),
            &update,
        );
        let authoritative = ProposalView::new(update.status, update.last_modified);

        match decision {
            Reconciliation::Stale => {
                debug!(proposal = %id, status = %update.status, "handle_push: stale update dropped");
            }
            Reconciliation::Ignore => {
                debug!(proposal = %id, status = %update.status, "handle_push: pending update ignored during submission");
            }
            Reconciliation::WriteView => reg.view.set(&id, authoritative),
            Reconciliation::Agree => {
                if let Some(entry) = reg.sessions.get_mut(&id) {
                    entry.cancel.cancel();
                    if self.apply_step(&mut entry.session, SessionEvent::PushAgreed, now) {
                        callback = entry.on_success.take();
                    }
                }
                reg.confirm_optimistic(&id);
                reg.view.set(&id, authoritative);
                info!(proposal = %id, status = %update.status, "handle_push: remote agrees with session");
            }
            Reconciliation::Conflict => {
                if let Some(entry) = reg.sessions.get(&id) {
                    entry.cancel.cancel();
                }
                if reg.rollback(&id) {
                    self.emit(CoordinatorEvent::RolledBack {
                        proposal_id: id.clone(),
                    });
                }
                if let Some(entry) = reg.sessions.get_mut(&id) {
                    self.apply_step(&mut entry.session, SessionEvent::PushConflicted, now);
                }
                reg.view.set(&id, authoritative);
                warn!(proposal = %id, status = %update.status, "handle_push: proposal resolved elsewhere, session failed");
                self.schedule_auto_refresh(reg, &id);
            }
        }

        self.flush_view(reg);
        self.emit(CoordinatorEvent::PushReconciled {
            proposal_id: id.clone(),
            outcome: decision,
        });
        drop(guard);

        if let Some(cb) = callback {
            cb(&id);
        }
        decision
    }

    /// Consume the push feed until it closes or the coordinator shuts down.
    pub fn spawn_push_listener(&self, mut updates: mpsc::Receiver<PushUpdate>) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    update = updates.recv() => match update {
                        Some(update) => {
                            this.handle_push(update).await;
                        }
                        None => break,
                    },
                }
            }
            debug!("push listener stopped");
        })
    }

    pub async fn connection_health(&self) -> Option<ConnectionHealth> {
        match &self.inner.channel {
            Some(channel) => Some(channel.connection_health().await),
            None => None,
        }
    }

    pub async fn reconnect(&self) -> std::result::Result<(), RemoteError> {
        let channel = self
            .inner
            .channel
            .as_ref()
            .ok_or_else(|| RemoteError::new("connection: no push channel configured"))?;
        info!("reconnect: requested");
        channel.reconnect().await
    }

    // -----------------------------------------------------------------------
    // Watchdog
    // -----------------------------------------------------------------------

    /// Scan every session once and flag the ones busy for too long.
    pub async fn check_stuck(&self) -> Vec<(ProposalId, StuckSignal)> {
        let now = Instant::now().into_std();
        let mut guard = self.inner.registry.lock().await;
        let mut flagged = Vec::new();
        for (id, entry) in guard.sessions.iter_mut() {
            let Some(signal) = self.inner.detector.check(&entry.session, now) else {
                continue;
            };
            warn!(
                proposal = %id,
                state = %entry.session.state,
                elapsed_ms = signal.elapsed_ms,
                "watchdog: session stuck"
            );
            entry.session.stuck = Some(signal.clone());
            self.emit(CoordinatorEvent::Stuck {
                proposal_id: id.clone(),
                signal: signal.clone(),
            });
            flagged.push((id.clone(), signal));
        }
        flagged
    }

    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        let this = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.watchdog_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.check_stuck().await;
                    }
                }
            }
            debug!("watchdog stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub async fn session(&self, id: &ProposalId) -> Option<ActionSession> {
        let guard = self.inner.registry.lock().await;
        guard.sessions.get(id).map(|e| e.session.clone())
    }

    pub async fn sessions(&self) -> Vec<ActionSession> {
        let guard = self.inner.registry.lock().await;
        let mut all: Vec<_> = guard.sessions.values().map(|e| e.session.clone()).collect();
        all.sort_by(|a, b| a.proposal_id.cmp(&b.proposal_id));
        all
    }

    pub async fn view(&self, id: &ProposalId) -> Option<ProposalView> {
        let guard = self.inner.registry.lock().await;
        guard.view.get(id).cloned()
    }

    pub async fn diagnostics(&self, id: &ProposalId) -> DiagnosticSnapshot {
        let connection = self.connection_health().await;
        let guard = self.inner.registry.lock().await;
        DiagnosticSnapshot::capture(
            id,
            guard.sessions.get(id).map(|e| &e.session),
            guard.view.get(id),
            connection,
            self.inner.config.connection.healthy_latency_ms,
            Instant::now().into_std(),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Event stream for a single observer. Lagged events are skipped.
    pub fn events(&self) -> impl Stream<Item = CoordinatorEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|msg| msg.ok())
    }

    /// Stop every driver, timer and background task.
    pub fn shutdown(&self) {
        info!("coordinator shutting down");
        self.inner.shutdown.cancel();
    }

    // -----------------------------------------------------------------------
    // Submission driver
    // -----------------------------------------------------------------------

    /// Apply the tentative status and spawn the driver for the session's
    /// current epoch. The session must already be `OptimisticallyApplied`.
    fn begin_submission(&self, reg: &mut Registry, id: &ProposalId, now: Instant) {
        let Some(entry) = reg.sessions.get_mut(id) else {
            return;
        };
        let expected = entry.session.expected_status();
        entry.cancel = self.inner.shutdown.child_token();

        let driver = Driver {
            coordinator: self.clone(),
            proposal_id: id.clone(),
            session_id: entry.session.id,
            epoch: entry.session.epoch,
            action: entry.session.action_type,
            reason: entry.session.rejection_reason.clone(),
            cancel: entry.cancel.clone(),
        };

        let snapshot = reg.optimistic.apply(&mut reg.view, id, expected);
        if let Some(entry) = reg.sessions.get_mut(id) {
            entry.session.optimistic_snapshot = Some(snapshot);
        }
        reg.last_submission.insert(id.clone(), now);
        self.flush_view(reg);

        info!(proposal = %id, epoch = driver.epoch, "begin_submission: spawning driver");
        tokio::spawn(driver.run());
    }

    async fn attempt_failed(
        &self,
        d: &Driver,
        attempt: u32,
        total: u32,
        failure: &AttemptFailure,
        will_retry: bool,
    ) {
        let now = Instant::now();
        let mut guard = self.inner.registry.lock().await;
        let Some(entry) = guard.current(&d.proposal_id, d.session_id, d.epoch) else {
            d.cancel.cancel();
            return;
        };
        warn!(
            proposal = %d.proposal_id,
            attempt,
            total,
            category = %failure.classification.category,
            error = %failure.error,
            will_retry,
            "submission attempt failed"
        );
        self.emit(CoordinatorEvent::AttemptFailed {
            proposal_id: d.proposal_id.clone(),
            attempt,
            max_attempts: total,
            classification: failure.classification.clone(),
            will_retry,
        });
        if will_retry {
            let event = SessionEvent::SubmissionFailed(failure.classification.clone());
            if !self.apply_step(&mut entry.session, event, now) {
                d.cancel.cancel();
            }
        }
    }

    async fn retry_elapsed(&self, d: &Driver, attempt: u32, total: u32) {
        let now = Instant::now();
        let mut guard = self.inner.registry.lock().await;
        let reg = &mut *guard;
        let Some(entry) = reg.current(&d.proposal_id, d.session_id, d.epoch) else {
            d.cancel.cancel();
            return;
        };
        if entry.session.state != SessionState::RetryScheduled
            || !self.apply_step(&mut entry.session, SessionEvent::RetryElapsed, now)
        {
            d.cancel.cancel();
            return;
        }
        reg.last_submission.insert(d.proposal_id.clone(), now);
        info!(proposal = %d.proposal_id, attempt, total, "retrying submission");
    }

    async fn settle(&self, d: &Driver, outcome: RunOutcome<()>) {
        if outcome.cancelled {
            debug!(proposal = %d.proposal_id, epoch = d.epoch, "driver cancelled");
            return;
        }
        let now = Instant::now();
        let mut callback = None;

        {
            let mut guard = self.inner.registry.lock().await;
            let reg = &mut *guard;
            let Some(entry) = reg
                .current(&d.proposal_id, d.session_id, d.epoch)
                .filter(|e| e.session.state == SessionState::OptimisticallyApplied)
            else {
                debug!(proposal = %d.proposal_id, epoch = d.epoch, "stale settlement ignored");
                return;
            };

            if outcome.success() {
                let await_push = self.inner.config.reconciliation.await_push_confirmation;
                let event = SessionEvent::SubmissionSucceeded { await_push };
                if !self.apply_step(&mut entry.session, event, now) {
                    return;
                }
                if entry.session.state == SessionState::Succeeded {
                    callback = entry.on_success.take();
                    reg.confirm_optimistic(&d.proposal_id);
                } else {
                    self.spawn_grace_timer(d);
                }
            } else if let Some(failure) = outcome.error {
                let category = failure.classification.category;
                let event = SessionEvent::SubmissionFailed(failure.classification);
                if !self.apply_step(&mut entry.session, event, now) {
                    return;
                }
                if reg.rollback(&d.proposal_id) {
                    info!(proposal = %d.proposal_id, "optimistic change rolled back");
                    self.emit(CoordinatorEvent::RolledBack {
                        proposal_id: d.proposal_id.clone(),
                    });
                }
                self.flush_view(reg);
                if category == swap_core::ErrorCategory::Validation {
                    self.schedule_auto_refresh(reg, &d.proposal_id);
                }
            }
        }

        if let Some(cb) = callback {
            cb(&d.proposal_id);
        }
    }

    fn spawn_grace_timer(&self, d: &Driver) {
        let this = self.clone();
        let grace = self.inner.config.reconciliation_grace();
        let (id, session_id, epoch, cancel) =
            (d.proposal_id.clone(), d.session_id, d.epoch, d.cancel.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            let now = Instant::now();
            let mut callback = None;
            {
                let mut guard = this.inner.registry.lock().await;
                let reg = &mut *guard;
                let Some(entry) = reg.current(&id, session_id, epoch) else {
                    return;
                };
                debug!(proposal = %id, "reconciliation grace elapsed without push");
                if this.apply_step(&mut entry.session, SessionEvent::ReconciliationGraceElapsed, now)
                {
                    callback = entry.on_success.take();
                    reg.confirm_optimistic(&id);
                }
            }
            if let Some(cb) = callback {
                cb(&id);
            }
        });
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    fn schedule_auto_refresh(&self, reg: &mut Registry, id: &ProposalId) {
        let budget = self.inner.config.reconciliation.max_auto_refreshes;
        let Some(entry) = reg.sessions.get_mut(id) else {
            return;
        };
        if entry.session.auto_refreshes >= budget {
            warn!(proposal = %id, budget, "automatic refresh budget spent, manual action required");
            return;
        }
        entry.session.auto_refreshes += 1;
        let this = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            this.run_refresh(&id, true).await;
        });
    }

    async fn run_refresh(&self, id: &ProposalId, automatic: bool) -> RunOutcome<()> {
        info!(proposal = %id, automatic, "refreshing proposal");
        self.emit(CoordinatorEvent::RefreshStarted {
            proposal_id: id.clone(),
            automatic,
        });
        let policy = self.inner.config.policy_for(OperationKind::Refresh);
        let remote = self.inner.remote.clone();
        let cancel = self.inner.shutdown.child_token();
        let outcome = run_with_timeout(
            |_| {
                let remote = remote.clone();
                let id = id.clone();
                async move { remote.refresh_proposal(&id).await }
            },
            &policy,
            &(),
            &cancel,
        )
        .await;
        if let Some(failure) = &outcome.error {
            warn!(proposal = %id, attempts = outcome.attempts, error = %failure.error, "refresh failed");
        }
        self.emit(CoordinatorEvent::RefreshFinished {
            proposal_id: id.clone(),
            success: outcome.success(),
            attempts: outcome.attempts,
        });
        outcome
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn step(&self, session: &mut ActionSession, event: SessionEvent, now: Instant) -> Result<StateChange> {
        let name = event.name();
        let change = session.handle(event, now.into_std())?;
        if let StateChange::Moved { from, to } = change {
            info!(
                proposal = %session.proposal_id,
                %from,
                %to,
                event = name,
                attempt = session.attempt,
                max_attempts = session.max_attempts,
                "session transition"
            );
            let message = match to {
                SessionState::RetryScheduled | SessionState::TerminallyFailed => {
                    session.last_error.as_ref().map(|c| c.user_message.clone())
                }
                _ => None,
            };
            self.emit(CoordinatorEvent::StateChanged {
                proposal_id: session.proposal_id.clone(),
                from,
                to,
                attempt: session.attempt,
                max_attempts: session.max_attempts,
                message,
            });
            if to == SessionState::Succeeded {
                self.emit(CoordinatorEvent::Succeeded {
                    proposal_id: session.proposal_id.clone(),
                    attempt: session.attempt,
                });
            }
        }
        Ok(change)
    }

    /// [`Self::step`] for internal events, where a rejected transition is
    /// logged rather than returned. True when the session moved.
    fn apply_step(&self, session: &mut ActionSession, event: SessionEvent, now: Instant) -> bool {
        let name = event.name();
        match self.step(session, event, now) {
            Ok(change) => matches!(change, StateChange::Moved { .. }),
            Err(e) => {
                warn!(proposal = %session.proposal_id, event = name, error = %e, "transition rejected");
                false
            }
        }
    }

    fn check_debounce(&self, reg: &mut Registry, id: &ProposalId, now: Instant) -> Result<()> {
        let window = self.inner.config.debounce();
        reg.prune_stamps(now, window);
        let Some(last) = reg.last_submission.get(id) else {
            return Ok(());
        };
        let elapsed = now.saturating_duration_since(*last);
        if elapsed >= window {
            return Ok(());
        }
        let remaining_ms = (window - elapsed).as_millis() as u64;
        warn!(proposal = %id, remaining_ms, "duplicate action inside debounce window ignored");
        self.ignored(id, "debounced");
        Err(SwapError::Debounced {
            proposal: id.clone(),
            remaining_ms,
        })
    }

    fn ignored(&self, id: &ProposalId, reason: &str) {
        self.emit(CoordinatorEvent::IntentIgnored {
            proposal_id: id.clone(),
            reason: reason.to_string(),
        });
    }

    fn flush_view(&self, reg: &mut Registry) {
        for change in reg.view.drain_changes() {
            self.emit(CoordinatorEvent::ViewChanged {
                proposal_id: change.proposal_id,
                previous: change.previous,
                current: change.current,
            });
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No receivers is fine.
        let _ = self.inner.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// One submission cycle of one session. Identified by session id and epoch
/// so settlements from an earlier cycle are recognised and dropped.
struct Driver {
    coordinator: Coordinator,
    proposal_id: ProposalId,
    session_id: Uuid,
    epoch: u64,
    action: ActionType,
    reason: Option<String>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self) {
        let config = &self.coordinator.inner.config;
        let policy = config.policy_for(self.action.operation());
        let remote = self.coordinator.inner.remote.clone();
        let (id, action, reason) = (self.proposal_id.clone(), self.action, self.reason.clone());

        let outcome = run_with_timeout(
            |attempt| {
                debug!(proposal = %id, attempt, "submitting");
                let remote = remote.clone();
                let id = id.clone();
                let reason = reason.clone();
                async move { remote::submit(&*remote, &id, action, reason.as_deref()).await }
            },
            &policy,
            &self,
            &self.cancel,
        )
        .await;

        debug!(
            proposal = %self.proposal_id,
            attempts = outcome.attempts,
            success = outcome.success(),
            timed_out = outcome.timed_out,
            duration_ms = outcome.total_duration.as_millis() as u64,
            "submission run finished"
        );
        self.coordinator.settle(&self, outcome).await;
    }
}

#[async_trait]
impl SupervisorHooks for Driver {
    async fn on_timeout(&self, attempt: u32, total: u32) {
        warn!(proposal = %self.proposal_id, attempt, total, "submission attempt timed out");
    }

    async fn on_failure(&self, attempt: u32, total: u32, failure: &AttemptFailure, will_retry: bool) {
        self.coordinator
            .attempt_failed(self, attempt, total, failure, will_retry)
            .await;
    }

    async fn on_retry(&self, attempt: u32, total: u32) {
        self.coordinator.retry_elapsed(self, attempt, total).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedRemote, Step};

    async fn stamps(c: &Coordinator) -> usize {
        c.inner.registry.lock().await.last_submission.len()
    }

    #[tokio::test(start_paused = true)]
    async fn expired_debounce_stamps_are_pruned() {
        let remote = Arc::new(
            ScriptedRemote::new()
                .with_script("P1", OperationKind::Accept, [Step::fail("403 Forbidden")])
                .with_script("P2", OperationKind::Accept, [Step::fail("403 Forbidden")]),
        );
        let c = Coordinator::new(CoordinatorConfig::default(), remote, None);
        c.user_intent(Intent::accept("P1")).await.unwrap();
        c.user_intent(Intent::accept("P2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stamps(&c).await, 2);

        // Inside the window nothing is forgotten.
        c.dismiss(&ProposalId::new("P1")).await.unwrap();
        assert_eq!(stamps(&c).await, 2);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        c.dismiss(&ProposalId::new("P2")).await.unwrap();
        assert_eq!(stamps(&c).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_check_prunes_other_proposals() {
        let remote = Arc::new(ScriptedRemote::new());
        let c = Coordinator::new(CoordinatorConfig::default(), remote, None);
        c.user_intent(Intent::accept("P1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(stamps(&c).await, 1);

        c.user_intent(Intent::accept("P2")).await.unwrap();
        let guard = c.inner.registry.lock().await;
        assert_eq!(guard.last_submission.len(), 1);
        assert!(guard.last_submission.contains_key(&ProposalId::new("P2")));
    }
}

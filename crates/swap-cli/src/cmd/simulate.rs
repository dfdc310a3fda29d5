use crate::output::{print_fields, print_json, print_table};
use anyhow::Context;
use clap::ValueEnum;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use swap_coordinator::{
    Coordinator, CoordinatorEvent, Intent, PushChannel, RemoteCall, ScriptedChannel,
    ScriptedRemote, Step,
};
use swap_core::config::CoordinatorConfig;
use swap_core::connection::ConnectionHealth;
use swap_core::diagnostics::DiagnosticSnapshot;
use swap_core::view::ProposalView;
use swap_core::{ActionSession, OperationKind, ProposalId, ProposalStatus, PushUpdate, SessionState};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

const POLL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// Accept succeeds on the first attempt
    AcceptOk,
    /// Reject fails twice with a network error, then succeeds
    RejectFlaky,
    /// Accept never answers; every attempt times out
    AcceptHang,
    /// Accept is in flight when a push reports the proposal rejected
    PushConflict,
    /// Accept outlives the loading budget; the watchdog flags it and it is recovered
    Stuck,
}

impl Scenario {
    fn proposal(self) -> ProposalId {
        ProposalId::new(match self {
            Scenario::AcceptOk => "P1",
            Scenario::RejectFlaky => "P2",
            Scenario::AcceptHang => "P3",
            Scenario::PushConflict => "P4",
            Scenario::Stuck => "P5",
        })
    }

    fn intent(self) -> Intent {
        match self {
            Scenario::RejectFlaky => Intent::reject(self.proposal()).with_reason("price moved"),
            _ => Intent::accept(self.proposal()),
        }
    }

    /// Remote script and any config adjustments the scenario depends on.
    fn prepare(self, mut config: CoordinatorConfig, speed: u32) -> (ScriptedRemote, CoordinatorConfig) {
        let id = self.proposal();
        let remote = ScriptedRemote::new();
        let remote = match self {
            Scenario::AcceptOk => remote.with_script(
                id,
                OperationKind::Accept,
                [Step::ok_after(Duration::from_millis(500 / u64::from(speed.max(1))))],
            ),
            Scenario::RejectFlaky => remote.with_script(
                id,
                OperationKind::Reject,
                [
                    Step::fail("Network request failed"),
                    Step::fail("Network request failed"),
                ],
            ),
            Scenario::AcceptHang | Scenario::PushConflict => remote.with_script(
                id,
                OperationKind::Accept,
                std::iter::repeat(Step::Hang).take(config.retry.submission_max_attempts.max(1) as usize),
            ),
            Scenario::Stuck => {
                // The attempt must still be running when the watchdog looks.
                config.timeouts.accept_ms = config.watchdog.max_loading_time_ms.saturating_mul(3).max(1);
                remote.with_script(id, OperationKind::Accept, [Step::Hang])
            }
        };
        (remote, config)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TimedEvent {
    at_ms: u64,
    #[serde(flatten)]
    event: CoordinatorEvent,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    scenario: Scenario,
    speed: u32,
    proposal_id: ProposalId,
    session: Option<ActionSession>,
    view: Option<ProposalView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovered: Option<bool>,
    diagnostics: DiagnosticSnapshot,
    calls: Vec<RemoteCall>,
    events: Vec<TimedEvent>,
    elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Drains the coordinator's event feed while the scenario runs.
struct Recorder {
    rx: broadcast::Receiver<CoordinatorEvent>,
    started: Instant,
    events: Vec<TimedEvent>,
}

impl Recorder {
    fn new(rx: broadcast::Receiver<CoordinatorEvent>) -> Self {
        Self {
            rx,
            started: Instant::now(),
            events: Vec::new(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    let at_ms = self.elapsed_ms();
                    self.events.push(TimedEvent { at_ms, event });
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event recorder lagged");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn saw(&self, kind: &str) -> bool {
        self.events.iter().any(|e| e.event.kind() == kind)
    }

    /// Poll until `done` holds for the proposal's session or `limit` passes.
    async fn wait_for(
        &mut self,
        coordinator: &Coordinator,
        id: &ProposalId,
        limit: Duration,
        done: impl Fn(Option<&ActionSession>) -> bool,
    ) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            self.drain();
            if done(coordinator.session(id).await.as_ref()) {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(proposal = %id, limit_ms = limit.as_millis() as u64, "simulation wait expired");
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
    }

    async fn wait_for_event(&mut self, kind: &str, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            self.drain();
            if self.saw(kind) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

/// Generous upper bound for one scenario under `config`.
fn run_limit(config: &CoordinatorConfig) -> Duration {
    let policy = config.policy_for(OperationKind::Accept);
    let slowest = config
        .timeout_for(OperationKind::Accept)
        .max(config.timeout_for(OperationKind::Reject));
    let per_attempt = slowest + policy.backoff.ceiling(policy.max_attempts);
    per_attempt * (policy.max_attempts + 1)
        + config.max_loading_time()
        + config.reconciliation_grace()
        + Duration::from_secs(1)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(root: &Path, scenario: Scenario, speed: u32, json: bool) -> anyhow::Result<()> {
    let config = CoordinatorConfig::load(root).context("failed to load config")?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(simulate(scenario, config, speed))?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn simulate(
    scenario: Scenario,
    config: CoordinatorConfig,
    speed: u32,
) -> anyhow::Result<SimulationReport> {
    let id = scenario.proposal();
    let (remote, config) = scenario.prepare(config.scaled(speed), speed);
    let limit = run_limit(&config);
    let remote = Arc::new(remote);
    let channel: Arc<dyn PushChannel> = Arc::new(ScriptedChannel::new(ConnectionHealth::connected(35)));
    let coordinator = Coordinator::new(config, remote.clone(), Some(channel));
    let mut recorder = Recorder::new(coordinator.subscribe());

    let (push_tx, push_rx) = mpsc::channel(16);
    let listener = coordinator.spawn_push_listener(push_rx);
    let watchdog = coordinator.spawn_watchdog();

    info!(scenario = ?scenario, proposal = %id, speed, "simulation started");
    coordinator
        .handle_push(PushUpdate::new(id.clone(), ProposalStatus::Pending))
        .await;

    let accepted = coordinator.user_intent(scenario.intent()).await?;
    if accepted.state == SessionState::Confirming {
        coordinator.confirm(&id).await?;
    }

    let mut recovered = None;
    let mut diagnostics = None;
    match scenario {
        Scenario::PushConflict => {
            push_tx
                .send(PushUpdate::new(id.clone(), ProposalStatus::Rejected))
                .await
                .context("push listener stopped")?;
            recorder
                .wait_for(&coordinator, &id, limit, |s| s.map_or(true, ActionSession::is_terminal))
                .await;
            recorder.wait_for_event("refresh_finished", limit).await;
        }
        Scenario::Stuck => {
            recorder
                .wait_for(&coordinator, &id, limit, |s| s.map_or(true, |s| s.stuck.is_some()))
                .await;
            diagnostics = Some(coordinator.diagnostics(&id).await);
            let outcome = coordinator.recover(&id).await?;
            recovered = Some(outcome.success());
        }
        _ => {
            recorder
                .wait_for(&coordinator, &id, limit, |s| s.map_or(true, ActionSession::is_terminal))
                .await;
        }
    }

    let diagnostics = match diagnostics {
        Some(d) => d,
        None => coordinator.diagnostics(&id).await,
    };
    let session = coordinator.session(&id).await;
    let view = coordinator.view(&id).await;

    coordinator.shutdown();
    drop(push_tx);
    let _ = watchdog.await;
    let _ = listener.await;
    recorder.drain();

    let elapsed_ms = recorder.elapsed_ms();
    info!(
        scenario = ?scenario,
        state = session.as_ref().map(|s| s.state.as_str()).unwrap_or("none"),
        elapsed_ms,
        "simulation finished"
    );

    Ok(SimulationReport {
        scenario,
        speed,
        proposal_id: id,
        session,
        view,
        recovered,
        diagnostics,
        calls: remote.calls().await,
        events: recorder.events,
        elapsed_ms,
    })
}

// ---------------------------------------------------------------------------
// Text output
// ---------------------------------------------------------------------------

fn print_report(report: &SimulationReport) {
    let rows = report
        .events
        .iter()
        .map(|e| vec![e.at_ms.to_string(), e.event.kind().to_string(), describe(&e.event)])
        .collect();
    print_table(&["AT_MS", "EVENT", "DETAIL"], rows);
    println!();

    let mut fields = vec![("proposal", report.proposal_id.to_string())];
    match &report.session {
        Some(s) => {
            fields.push(("session", s.state.to_string()));
            fields.push(("attempt", format!("{}/{}", s.attempt, s.max_attempts)));
            if let Some(err) = &s.last_error {
                fields.push(("error", format!("{} ({})", err.user_message, err.category)));
            }
        }
        None => fields.push(("session", "none".to_string())),
    }
    fields.push((
        "view",
        report
            .view
            .as_ref()
            .map(|v| v.status.to_string())
            .unwrap_or_else(|| "absent".to_string()),
    ));
    if let Some(recovered) = report.recovered {
        fields.push(("recovered", recovered.to_string()));
    }
    fields.push(("remote calls", summarize_calls(&report.calls)));
    fields.push(("elapsed", format!("{}ms", report.elapsed_ms)));
    print_fields(&fields);
}

fn summarize_calls(calls: &[RemoteCall]) -> String {
    let mut counts: Vec<(OperationKind, usize)> = Vec::new();
    for call in calls {
        match counts.iter_mut().find(|(op, _)| *op == call.operation) {
            Some((_, n)) => *n += 1,
            None => counts.push((call.operation, 1)),
        }
    }
    if counts.is_empty() {
        return "none".to_string();
    }
    counts
        .iter()
        .map(|(op, n)| format!("{op} x{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_of(view: &Option<ProposalView>) -> String {
    view.as_ref()
        .map(|v| v.status.to_string())
        .unwrap_or_else(|| "absent".to_string())
}

fn describe(event: &CoordinatorEvent) -> String {
    match event {
        CoordinatorEvent::SessionStarted { action, state, .. } => format!("{action} -> {state}"),
        CoordinatorEvent::StateChanged {
            from,
            to,
            attempt,
            max_attempts,
            message,
            ..
        } => {
            let mut out = format!("{from} -> {to} ({attempt}/{max_attempts})");
            if let Some(m) = message {
                out.push_str(": ");
                out.push_str(m);
            }
            out
        }
        CoordinatorEvent::SessionClosed { reason, .. } => {
            format!("{reason:?}").to_lowercase()
        }
        CoordinatorEvent::ViewChanged {
            previous, current, ..
        } => format!("{} -> {}", status_of(previous), status_of(current)),
        CoordinatorEvent::RolledBack { .. } => "tentative status undone".to_string(),
        CoordinatorEvent::AttemptFailed {
            attempt,
            max_attempts,
            classification,
            will_retry,
            ..
        } => format!(
            "attempt {attempt}/{max_attempts}: {} ({})",
            classification.category,
            if *will_retry { "retrying" } else { "final" }
        ),
        CoordinatorEvent::IntentIgnored { reason, .. } => reason.clone(),
        CoordinatorEvent::PushReconciled { outcome, .. } => outcome.as_str().to_string(),
        CoordinatorEvent::RefreshStarted { automatic, .. } => {
            let kind = if *automatic { "automatic" } else { "manual" };
            kind.to_string()
        }
        CoordinatorEvent::RefreshFinished {
            success, attempts, ..
        } => format!(
            "{} after {attempts} attempt(s)",
            if *success { "ok" } else { "failed" }
        ),
        CoordinatorEvent::Stuck { signal, .. } => format!("busy for {}ms", signal.elapsed_ms),
        CoordinatorEvent::Succeeded { attempt, .. } => format!("on attempt {attempt}"),
        CoordinatorEvent::DirectSubmitFinished {
            action, success, ..
        } => format!("{action} {}", if *success { "ok" } else { "failed" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swap_core::ActionType;

    #[test]
    fn run_limit_covers_every_attempt() {
        let config = CoordinatorConfig::default();
        // 3 attempts of 45s with 2s delays, plus watchdog and grace.
        assert!(run_limit(&config) > Duration::from_secs(45 * 3 + 4));
    }

    #[test]
    fn stuck_scenario_outlives_loading_budget() {
        let (_, config) = Scenario::Stuck.prepare(CoordinatorConfig::default(), 1);
        assert!(config.timeout_for(OperationKind::Accept) > config.max_loading_time());
    }

    #[test]
    fn reject_flaky_carries_reason() {
        let intent = Scenario::RejectFlaky.intent();
        assert_eq!(intent.action, ActionType::Reject);
        assert_eq!(intent.reason.as_deref(), Some("price moved"));
    }

    #[test]
    fn call_summary_groups_by_operation() {
        let call = |operation| RemoteCall {
            operation,
            proposal_id: ProposalId::new("P1"),
            reason: None,
        };
        let calls = vec![
            call(OperationKind::Accept),
            call(OperationKind::Accept),
            call(OperationKind::Refresh),
        ];
        assert_eq!(summarize_calls(&calls), "accept x2, refresh x1");
        assert_eq!(summarize_calls(&[]), "none");
    }
}

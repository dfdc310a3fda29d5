//! `swap-coordinator`: drives accept/reject actions on swap proposals.
//!
//! The synchronous rules live in `swap-core`; this crate owns the tasks,
//! timers and locks around them.
//!
//! # Architecture
//!
//! ```text
//! Coordinator::user_intent ──► registry (one Mutex)
//!     │                          sessions · view model · optimistic snapshots
//!     │                          debounce stamps · success callbacks
//!     ▼
//! Driver (tokio task, one per submission cycle)
//!     │  run_with_timeout ── deadline race · classified failures · retry delay
//!     │  SupervisorHooks  ── on_failure / on_retry update the session
//!     ▼
//! ProposalRemote          ← submit_accept / submit_reject / refresh_proposal
//!
//! push feed (mpsc) ──► handle_push ──► reconcile ──► agree / conflict / write
//! watchdog interval ──► check_stuck ──► StuckSignal overlay
//! every change ──► CoordinatorEvent broadcast
//! ```
//!
//! No remote call is awaited while the registry lock is held. A driver is
//! tagged with its session id and epoch, so a settlement that arrives after
//! the session moved on is dropped.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use swap_coordinator::{Coordinator, Intent, ScriptedRemote};
//!
//! let remote = Arc::new(ScriptedRemote::new());
//! let coordinator = Coordinator::new(Default::default(), remote, None);
//! coordinator.spawn_watchdog();
//! coordinator.user_intent(Intent::accept("P1")).await?;
//! ```

pub mod coordinator;
pub mod events;
pub mod remote;
pub mod scripted;
pub mod supervisor;


pub use coordinator::{Coordinator, Intent, IntentAccepted, SuccessCallback};
pub use events::{CloseReason, CoordinatorEvent};
pub use remote::{PushChannel, ProposalRemote};
pub use scripted::{RemoteCall, ScriptedChannel, ScriptedRemote, Step};
pub use supervisor::{run_with_timeout, AttemptFailure, RunOutcome, SupervisorHooks};

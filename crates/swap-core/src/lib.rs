//! Synchronous domain model for coordinating accept/reject actions on swap
//! proposals: session state machine, optimistic view updates, push
//! reconciliation decisions, error classification, retry policy and stuck
//! detection. Nothing here performs I/O or awaits; `swap-coordinator` drives
//! these types from async tasks.

pub mod classifier;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod optimistic;
pub mod paths;
pub mod policy;
pub mod reconcile;
pub mod session;
pub mod types;
pub mod view;
pub mod watchdog;

pub use classifier::{classify, ErrorCategory, ErrorClassification};
pub use error::{RemoteError, Result, SwapError};
pub use session::{ActionSession, SessionEvent, SessionState, StateChange};
pub use types::{ActionType, OperationKind, ProposalId, ProposalStatus, PushUpdate};

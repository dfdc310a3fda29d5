//! Tentative local status changes that can be undone exactly.
//!
//! `apply` writes the tentative status into the [`ViewModel`] before any
//! network round trip and remembers what it replaced. `rollback` puts the
//! remembered value back byte for byte; `confirm` forgets it. At most one
//! change is outstanding per proposal, so repeated attempts never stack
//! snapshots of tentative state on top of each other.

use crate::types::{ProposalId, ProposalStatus};
use crate::view::{ProposalView, ViewModel, ViewSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct OptimisticUpdates {
    outstanding: HashMap<ProposalId, ViewSnapshot>,
}

impl OptimisticUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `tentative` for `id` and return the pre-change snapshot.
    ///
    /// The tentative entry keeps the previous `last_modified`: it is not an
    /// authoritative write and must not make genuine push updates look stale.
    pub fn apply(
        &mut self,
        view: &mut ViewModel,
        id: &ProposalId,
        tentative: ProposalStatus,
    ) -> ViewSnapshot {
        let snapshot = self
            .outstanding
            .entry(id.clone())
            .or_insert_with(|| view.snapshot(id))
            .clone();

        let last_modified = snapshot
            .0
            .as_ref()
            .map(|v| v.last_modified)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        view.set(id, ProposalView::new(tentative, last_modified));
        snapshot
    }

    /// Make the tentative status final. Returns whether a change was outstanding.
    pub fn confirm(&mut self, id: &ProposalId) -> bool {
        self.outstanding.remove(id).is_some()
    }

    /// Restore the exact pre-change entry. A no-op (returning `false`) when
    /// nothing is outstanding for `id`.
    pub fn rollback(&mut self, view: &mut ViewModel, id: &ProposalId, snapshot: &ViewSnapshot) -> bool {
        if self.outstanding.remove(id).is_none() {
            return false;
        }
        view.restore(id, snapshot);
        true
    }

    pub fn is_outstanding(&self, id: &ProposalId) -> bool {
        self.outstanding.contains_key(id)
    }
}

//! The shared view model: the proposal status every observer renders.
//!
//! Only the optimistic manager and the reconciliation path write to it.
//! Every write is recorded as a [`ViewChange`] so the owner can publish it.

use crate::types::{ProposalId, ProposalStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalView {
    pub status: ProposalStatus,
    pub last_modified: DateTime<Utc>,
}

impl ProposalView {
    pub fn new(status: ProposalStatus, last_modified: DateTime<Utc>) -> Self {
        Self {
            status,
            last_modified,
        }
    }
}

/// The exact view entry as it was before a tentative change. `None` means the
/// proposal had no entry at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSnapshot(pub Option<ProposalView>);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewChange {
    pub proposal_id: ProposalId,
    pub previous: Option<ProposalView>,
    pub current: Option<ProposalView>,
}

#[derive(Debug, Default)]
pub struct ViewModel {
    entries: HashMap<ProposalId, ProposalView>,
    pending_changes: Vec<ViewChange>,
}

impl ViewModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ProposalId) -> Option<&ProposalView> {
        self.entries.get(id)
    }

    pub fn status(&self, id: &ProposalId) -> Option<ProposalStatus> {
        self.entries.get(id).map(|v| v.status)
    }

    pub fn snapshot(&self, id: &ProposalId) -> ViewSnapshot {
        ViewSnapshot(self.entries.get(id).cloned())
    }

    pub fn set(&mut self, id: &ProposalId, view: ProposalView) {
        let previous = self.entries.insert(id.clone(), view.clone());
        self.record(id, previous, Some(view));
    }

    /// Put back exactly what `snapshot` captured, including absence.
    pub fn restore(&mut self, id: &ProposalId, snapshot: &ViewSnapshot) {
        let previous = match &snapshot.0 {
            Some(view) => self.entries.insert(id.clone(), view.clone()),
            None => self.entries.remove(id),
        };
        self.record(id, previous, snapshot.0.clone());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes made since the last call, oldest first.
    pub fn drain_changes(&mut self) -> Vec<ViewChange> {
        std::mem::take(&mut self.pending_changes)
    }

    fn record(
        &mut self,
        id: &ProposalId,
        previous: Option<ProposalView>,
        current: Option<ProposalView>,
    ) {
        if previous != current {
            self.pending_changes.push(ViewChange {
                proposal_id: id.clone(),
                previous,
                current,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(status: ProposalStatus) -> ProposalView {
        ProposalView::new(status, Utc::now())
    }

    #[test]
    fn set_records_change() {
        let mut vm = ViewModel::new();
        let id = ProposalId::new("P1");
        vm.set(&id, view(ProposalStatus::Pending));
        assert_eq!(vm.status(&id), Some(ProposalStatus::Pending));
        let changes = vm.drain_changes();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].previous.is_none());
        assert!(vm.drain_changes().is_empty());
    }

    #[test]
    fn identical_write_is_not_a_change() {
        let mut vm = ViewModel::new();
        let id = ProposalId::new("P1");
        let v = view(ProposalStatus::Pending);
        vm.set(&id, v.clone());
        vm.drain_changes();
        vm.set(&id, v);
        assert!(vm.drain_changes().is_empty());
    }

    #[test]
    fn restore_absent_removes_entry() {
        let mut vm = ViewModel::new();
        let id = ProposalId::new("P1");
        let snap = vm.snapshot(&id);
        vm.set(&id, view(ProposalStatus::Accepted));
        vm.restore(&id, &snap);
        assert!(vm.get(&id).is_none());
        assert!(vm.is_empty());
    }
}

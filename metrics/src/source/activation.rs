//! Activation tracking for one source
//!
//! Requests are recorded first and committed to hardware either right away
//! or on the first GPU operation that needs them. Both paths go through
//! `ActivationTracker::transition`.

use crate::group::{GroupId, MetricGroupHandle};
use lzmetrics_shared::{MetricsError, Result};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Inactive,
    /// Requested but not yet pushed to hardware
    Pending,
    Active,
}

#[derive(Debug, Clone)]
pub enum ActivationEvent {
    Request {
        groups: Vec<MetricGroupHandle>,
        deferred: bool,
    },
    /// A GPU operation needs the requested groups in hardware
    Trigger,
}

/// Hardware work a transition asks the source to perform
#[derive(Debug, Clone, Default)]
pub struct Commit {
    pub deactivate: Vec<MetricGroupHandle>,
    pub activate: Vec<MetricGroupHandle>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.deactivate.is_empty() && self.activate.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivationSnapshot {
    requested: Vec<MetricGroupHandle>,
    committed: Vec<MetricGroupHandle>,
    /// Filled by sources that activate through their subdevices
    pub(crate) sub_devices: Vec<ActivationSnapshot>,
}

#[derive(Debug, Default)]
pub struct ActivationTracker {
    requested: Vec<MetricGroupHandle>,
    committed: Vec<MetricGroupHandle>,
}

fn ids(groups: &[MetricGroupHandle]) -> HashSet<GroupId> {
    groups.iter().map(|g| g.id()).collect()
}

fn missing_from(groups: &[MetricGroupHandle], other: &HashSet<GroupId>) -> Vec<MetricGroupHandle> {
    groups.iter().filter(|g| !other.contains(&g.id())).cloned().collect()
}

/// Drop repeated groups and reject two distinct groups sharing a domain
fn normalize(groups: Vec<MetricGroupHandle>) -> Result<Vec<MetricGroupHandle>> {
    let mut out: Vec<MetricGroupHandle> = Vec::with_capacity(groups.len());
    for group in groups {
        if out.iter().any(|g| g.id() == group.id()) {
            continue;
        }
        let domain = group.properties().domain;
        if let Some(existing) = out.iter().find(|g| g.properties().domain == domain) {
            return Err(MetricsError::invalid_argument(format!(
                "metric groups {} and {} share domain {}",
                existing.properties().name,
                group.properties().name,
                domain
            )));
        }
        out.push(group);
    }
    Ok(out)
}

impl ActivationTracker {
    pub fn state(&self) -> ActivationState {
        if ids(&self.requested) != ids(&self.committed) {
            ActivationState::Pending
        } else if self.committed.is_empty() {
            ActivationState::Inactive
        } else {
            ActivationState::Active
        }
    }

    /// Apply an event. The returned commit is already recorded as done; on
    /// hardware failure the caller restores a snapshot taken beforehand.
    pub fn transition(&mut self, event: ActivationEvent) -> Result<Option<Commit>> {
        let commit_now = match event {
            ActivationEvent::Request { groups, deferred } => {
                self.requested = normalize(groups)?;
                !deferred
            }
            ActivationEvent::Trigger => true,
        };

        if !commit_now || self.state() != ActivationState::Pending {
            debug!(state = ?self.state(), "activation recorded");
            return Ok(None);
        }

        let commit = Commit {
            deactivate: missing_from(&self.committed, &ids(&self.requested)),
            activate: missing_from(&self.requested, &ids(&self.committed)),
        };
        self.committed = self.requested.clone();
        Ok(Some(commit))
    }

    pub fn requested(&self) -> &[MetricGroupHandle] {
        &self.requested
    }

    pub fn committed(&self) -> &[MetricGroupHandle] {
        &self.committed
    }

    /// Activated, whether committed or still pending
    pub fn is_requested(&self, group: GroupId) -> bool {
        self.requested.iter().any(|g| g.id() == group)
    }

    pub fn is_active_in_hw(&self) -> bool {
        !self.committed.is_empty()
    }

    pub fn snapshot(&self) -> ActivationSnapshot {
        ActivationSnapshot {
            requested: self.requested.clone(),
            committed: self.committed.clone(),
            sub_devices: Vec::new(),
        }
    }

    /// Return to `snapshot`; the commit brings hardware back to its committed set
    pub fn restore(&mut self, snapshot: ActivationSnapshot) -> Commit {
        let commit = Commit {
            deactivate: missing_from(&self.committed, &ids(&snapshot.committed)),
            activate: missing_from(&snapshot.committed, &ids(&self.committed)),
        };
        self.requested = snapshot.requested;
        self.committed = snapshot.committed;
        commit
    }
}

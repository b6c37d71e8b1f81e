// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Phase inputs shared by the multi-phase workflows.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudenv_core::ResourceRef;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A workflow's phase enum. Declaration order is execution order.
pub trait Phase:
    Copy + Ord + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// First phase of the workflow.
    const INITIAL: Self;

    /// Every phase, in execution order.
    const ALL: &'static [Self];

    /// Stable name, for logs.
    fn as_str(self) -> &'static str;

    /// How long the workflow may stay in this phase. Only polling phases have one.
    fn budget(self) -> Option<Duration> {
        None
    }
}

/// Sum of the budgets of every phase of `P`.
pub fn total_budget<P: Phase>() -> Duration {
    P::ALL.iter().filter_map(|p| p.budget()).sum()
}

/// A phase transition that would move backwards.
#[derive(Debug, Error)]
#[error("phase cannot move from {from} back to {to}")]
pub struct PhaseRegression {
    /// Current phase.
    pub from: &'static str,
    /// Requested phase.
    pub to: &'static str,
}

/// An attempt to overwrite a resource reference with a different resource.
#[derive(Debug, Error)]
#[error("{slot} already references {existing}, refusing {replacement}")]
pub struct ResourceConflict {
    /// Which reference.
    pub slot: &'static str,
    /// Resource already referenced.
    pub existing: Uuid,
    /// Resource that was offered.
    pub replacement: Uuid,
}

/// Self-contained input of one step of a multi-phase workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput<P> {
    /// Aggregate the workflow operates on.
    pub environment_id: Uuid,
    /// Phase to run next.
    pub current_state: P,
    /// Why the workflow was started.
    pub reason: String,
    /// Aggregate `last_state_updated` when the workflow was submitted.
    pub last_state_updated: DateTime<Utc>,
    /// When `current_state` was entered.
    pub phase_entered_at: DateTime<Utc>,
    /// Compute resource, once known.
    #[serde(default)]
    pub compute: Option<ResourceRef>,
    /// OS disk, once known.
    #[serde(default)]
    pub os_disk: Option<ResourceRef>,
    /// Workspace storage, once known.
    #[serde(default)]
    pub storage: Option<ResourceRef>,
    /// Archive blob, once allocated.
    #[serde(default)]
    pub archive: Option<ResourceRef>,
    /// Skip graceful steps.
    #[serde(default)]
    pub force: bool,
}

impl<P: Phase> WorkflowInput<P> {
    /// Input for the first phase.
    pub fn new(environment_id: Uuid, reason: impl Into<String>, last_state_updated: DateTime<Utc>) -> Self {
        Self {
            environment_id,
            current_state: P::INITIAL,
            reason: reason.into(),
            last_state_updated,
            phase_entered_at: Utc::now(),
            compute: None,
            os_disk: None,
            storage: None,
            archive: None,
            force: false,
        }
    }

    /// Mark the workflow as forced.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Move to `next`. Staying put is allowed; moving backwards is not.
    pub fn advance(mut self, next: P) -> Result<Self, PhaseRegression> {
        if next < self.current_state {
            return Err(PhaseRegression {
                from: self.current_state.as_str(),
                to: next.as_str(),
            });
        }
        if next != self.current_state {
            self.current_state = next;
            self.phase_entered_at = Utc::now();
        }
        Ok(self)
    }

    /// Whether the current phase has outlived its budget.
    pub fn budget_exceeded(&self, now: DateTime<Utc>) -> bool {
        let Some(budget) = self.current_state.budget() else {
            return false;
        };
        (now - self.phase_entered_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed > budget)
    }
}

/// Fill `slot` with `resource`, refusing to replace a different resource.
pub fn attach(
    slot: &mut Option<ResourceRef>,
    name: &'static str,
    resource: &ResourceRef,
) -> Result<(), ResourceConflict> {
    match slot {
        Some(existing) if !existing.same_resource(resource) => Err(ResourceConflict {
            slot: name,
            existing: existing.resource_id,
            replacement: resource.resource_id,
        }),
        Some(_) => Ok(()),
        None => {
            *slot = Some(resource.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use cloudenv_core::ResourceType;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    enum Steps {
        One,
        Two,
        Three,
    }

    impl Phase for Steps {
        const INITIAL: Self = Self::One;
        const ALL: &'static [Self] = &[Self::One, Self::Two, Self::Three];

        fn as_str(self) -> &'static str {
            match self {
                Self::One => "one",
                Self::Two => "two",
                Self::Three => "three",
            }
        }

        fn budget(self) -> Option<Duration> {
            matches!(self, Self::Two).then_some(Duration::from_secs(60))
        }
    }

    #[test]
    fn test_total_budget_adds_polling_phases() {
        assert_eq!(total_budget::<Steps>(), Duration::from_secs(60));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let input = WorkflowInput::<Steps>::new(Uuid::new_v4(), "test", Utc::now());
        let input = input.advance(Steps::Three).unwrap();
        assert_eq!(input.current_state, Steps::Three);
        let err = input.advance(Steps::Two).unwrap_err();
        assert_eq!(err.from, "three");
        assert_eq!(err.to, "two");
    }

    #[test]
    fn test_advance_resets_phase_clock_only_on_change() {
        let mut input = WorkflowInput::<Steps>::new(Uuid::new_v4(), "test", Utc::now());
        input.phase_entered_at = Utc::now() - chrono::Duration::minutes(5);
        let stamped = input.phase_entered_at;

        let same = input.clone().advance(Steps::One).unwrap();
        assert_eq!(same.phase_entered_at, stamped);

        let moved = input.advance(Steps::Two).unwrap();
        assert!(moved.phase_entered_at > stamped);
    }

    #[test]
    fn test_budget_only_applies_to_polling_phases() {
        let mut input = WorkflowInput::<Steps>::new(Uuid::new_v4(), "test", Utc::now());
        input.phase_entered_at = Utc::now() - chrono::Duration::minutes(5);
        assert!(!input.budget_exceeded(Utc::now()));

        input.current_state = Steps::Two;
        assert!(input.budget_exceeded(Utc::now()));
    }

    #[test]
    fn test_attach_refuses_different_resource() {
        let a = ResourceRef::new(ResourceType::ComputeVm, "westus2", "basicLinux");
        let b = ResourceRef::new(ResourceType::ComputeVm, "westus2", "basicLinux");
        let mut slot = None;
        attach(&mut slot, "compute", &a).unwrap();
        attach(&mut slot, "compute", &a).unwrap();
        assert!(attach(&mut slot, "compute", &b).is_err());
        assert_eq!(slot.unwrap().resource_id, a.resource_id);
    }
}

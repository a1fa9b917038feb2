//! Request lifecycle and its append-only audit log
//!
//! The history is event-sourced: a request's current state is the fold of its
//! transitions, and entries are only ever appended.

use crate::error::{Result, VendorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

crate::define_tag_enum! {
    /// Lifecycle state of a request
    RequestState {
        InProgress => "in_progress" : "In progress",
        Complete => "complete" : "Complete",
        Failed => "failed" : "Failed",
        Stale => "stale" : "Stale",
    }
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestState::InProgress)
    }

    /// Whether the pipeline or the sweep may move from `self` to `next`
    ///
    /// Terminal states only change through the privileged update path.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        matches!((self, next), (RequestState::InProgress, _))
    }
}

/// One entry of the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: RequestState,
    pub state_reason: String,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// Append-only log of state transitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateHistory {
    entries: Vec<StateTransition>,
}

impl StateHistory {
    pub fn started(reason: impl Into<String>, actor: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            entries: vec![StateTransition {
                state: RequestState::InProgress,
                state_reason: reason.into(),
                updated: at,
                actor,
            }],
        }
    }

    /// Appends a transition, clamping its timestamp so the log never goes backwards
    pub fn append(
        &mut self,
        state: RequestState,
        reason: impl Into<String>,
        actor: Option<String>,
        at: DateTime<Utc>,
    ) -> &StateTransition {
        let updated = match self.entries.last() {
            Some(last) if last.updated > at => last.updated,
            _ => at,
        };
        self.entries.push(StateTransition {
            state,
            state_reason: reason.into(),
            updated,
            actor,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Appends a transition the lifecycle allows from the current state
    pub fn transition(
        &mut self,
        next: RequestState,
        reason: impl Into<String>,
        actor: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<&StateTransition> {
        let current = self.current_state();
        if !current.can_transition_to(next) {
            return Err(VendorError::InvalidState(format!(
                "A request in the \"{}\" state cannot move to \"{}\"",
                current, next
            )));
        }
        Ok(self.append(next, reason, actor, at))
    }

    /// Fold of the log: the state of the most recent transition
    pub fn current_state(&self) -> RequestState {
        self.entries
            .last()
            .map(|entry| entry.state)
            .unwrap_or(RequestState::InProgress)
    }

    pub fn current_reason(&self) -> &str {
        self.entries
            .last()
            .map(|entry| entry.state_reason.as_str())
            .unwrap_or("")
    }

    pub fn last(&self) -> Option<&StateTransition> {
        self.entries.last()
    }

    pub fn first(&self) -> Option<&StateTransition> {
        self.entries.first()
    }

    pub fn entries(&self) -> &[StateTransition] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_monotonic(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].updated <= pair[1].updated)
    }
}

// Copyright 2019 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ResourceAction, StackId, TraversalId};

pub type StackAction = ResourceAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StackStatus {
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub name: String,
    pub action: StackAction,
    pub status: StackStatus,
    pub status_reason: String,
    /// Opaque unique id. Changes on every new user operation; the stack-level lock (invariant 6).
    pub current_traversal: TraversalId,
    pub prev_raw_template_id: Option<String>,
    pub raw_template_id: String,
    pub disable_rollback: bool,
    pub timeout_mins: u32,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
    /// This crate only implements the `true` path.
    pub convergence: bool,
}

impl Stack {
    /// `timeout_mins × 60 − elapsed`. The driver receives this budget and must respect it; the
    /// scheduler enforces a hard timeout at expiry.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        let budget = std::time::Duration::from_secs(u64::from(self.timeout_mins) * 60);
        let elapsed = (now - self.created_time)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        budget.saturating_sub(elapsed)
    }

    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.time_remaining(now).is_zero()
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == StackStatus::InProgress
    }
}

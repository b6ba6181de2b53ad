// SPDX-License-Identifier: GPL-3.0-only

//! Service lifecycle and the snapshot published to `status`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the supervised pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    FailedBackoff,
    Stopping,
}

impl Lifecycle {
    /// Whether `self -> next` is a legal transition
    ///
    /// FailedBackoff -> Stopped is taken on an explicit stop and when a
    /// configured retry cap is exhausted.
    pub fn can_transition_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, FailedBackoff)
                | (Starting, Stopping)
                | (Running, FailedBackoff)
                | (Running, Stopping)
                | (FailedBackoff, Starting)
                | (FailedBackoff, Stopped)
                | (Stopping, Stopped)
        )
    }

    /// Starting or Running: a second start is a no-op
    pub fn is_active(self) -> bool {
        matches!(self, Lifecycle::Starting | Lifecycle::Running)
    }

    pub fn name(self) -> &'static str {
        match self {
            Lifecycle::Stopped => "stopped",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::FailedBackoff => "failed-backoff",
            Lifecycle::Stopping => "stopping",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: Lifecycle,
    pub to: Lifecycle,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

/// Snapshot of the supervised service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub lifecycle: Lifecycle,
    /// FailedBackoff entries since the last stable Running period
    pub restart_count: u32,
    pub last_exit_code: i32,
    pub last_transition_time: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Frames written by the current pipeline instance
    pub frames_written: u64,
    /// Capture process of the current pipeline instance
    pub pid: Option<u32>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::Stopped,
            restart_count: 0,
            last_exit_code: 0,
            last_transition_time: Utc::now(),
            last_error: None,
            frames_written: 0,
            pid: None,
        }
    }
}

impl ServiceState {
    /// Move to `next`, stamping the transition time
    pub fn transition(&mut self, next: Lifecycle) -> Result<Lifecycle, InvalidTransition> {
        let from = self.lifecycle;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.lifecycle = next;
        self.last_transition_time = Utc::now();
        if next == Lifecycle::Stopped {
            self.pid = None;
        }
        Ok(from)
    }
}

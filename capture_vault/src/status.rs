//! Capture Vault - Upload State Machine
//!
//! ```text
//!   pending ──► uploading ──► completed            (terminal, purged)
//!      ▲            │
//!      │            ├──► failed ──► uploading      (scheduled retry)
//!      │            │       │
//!      │            │       └──► pending           (manual retry)
//!      │            └──► permanently_failed        (terminal)
//!      └────────────────────────┘                  (manual retry)
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a capture in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStatus {
    /// Durably stored, never attempted
    Pending,
    /// A transfer is registered for this capture
    Uploading,
    /// Backend accepted the capture; blob and entry are being purged
    Completed,
    /// Last attempt failed with a retriable error
    Failed,
    /// Non-retriable failure or retry budget exhausted
    PermanentlyFailed,
}

impl CaptureStatus {
    pub const ALL: [CaptureStatus; 5] = [
        CaptureStatus::Pending,
        CaptureStatus::Uploading,
        CaptureStatus::Completed,
        CaptureStatus::Failed,
        CaptureStatus::PermanentlyFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureStatus::Pending => "pending",
            CaptureStatus::Uploading => "uploading",
            CaptureStatus::Completed => "completed",
            CaptureStatus::Failed => "failed",
            CaptureStatus::PermanentlyFailed => "permanently_failed",
        }
    }

    /// No automatic transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaptureStatus::Completed | CaptureStatus::PermanentlyFailed)
    }

    /// Whether the coordinator may claim an entry in this state
    pub fn is_uploadable(&self) -> bool {
        matches!(self, CaptureStatus::Pending | CaptureStatus::Failed)
    }

    /// Transition table enforced by the index
    pub fn can_transition_to(&self, next: CaptureStatus) -> bool {
        use CaptureStatus::*;

        matches!(
            (self, next),
            (Pending, Uploading)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Uploading, PermanentlyFailed)
                | (Failed, Uploading)
                | (Failed, Pending)
                | (PermanentlyFailed, Pending)
        )
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CaptureStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown capture status: {}", s))
    }
}

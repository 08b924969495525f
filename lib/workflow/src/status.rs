//! Status vocabulary shared by works, processings and collections.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a work. Processings share the same vocabulary.
///
/// `status` holds the last durable value; `substatus` additionally carries
/// operator intents (`ToCancel`, `ToSuspend`, ...) that must resolve before
/// the unit counts as terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    New,
    Ready,
    Transforming,
    Submitting,
    Submitted,
    Running,
    Finished,
    SubFinished,
    Failed,
    Expired,
    Cancelled,
    Suspended,
    Broken,
    ToCancel,
    Cancelling,
    ToSuspend,
    Suspending,
    ToResume,
    Resuming,
    ToExpire,
    Expiring,
    ToFinish,
    ToForceFinish,
    Terminating,
    FinishedOnStep,
    FinishedOnExec,
    FinishedTerm,
}

/// Processings use the work vocabulary.
pub type ProcessingStatus = WorkStatus;

impl WorkStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished
                | Self::SubFinished
                | Self::Failed
                | Self::Expired
                | Self::Cancelled
                | Self::Suspended
                | Self::Broken
                | Self::FinishedOnStep
                | Self::FinishedOnExec
                | Self::FinishedTerm
        )
    }

    /// Returns true for pending operator requests.
    #[must_use]
    pub fn is_operator_intent(&self) -> bool {
        matches!(
            self,
            Self::ToCancel
                | Self::ToSuspend
                | Self::ToResume
                | Self::ToExpire
                | Self::ToFinish
                | Self::ToForceFinish
        )
    }

    /// Returns true while an operator request is being actuated.
    #[must_use]
    pub fn is_in_operation(&self) -> bool {
        matches!(
            self,
            Self::Cancelling | Self::Suspending | Self::Resuming | Self::Expiring | Self::Terminating
        )
    }

    /// Returns true once a remote submission exists.
    #[must_use]
    pub fn is_submitted(&self) -> bool {
        matches!(self, Self::Submitted | Self::Running) || self.is_terminal()
    }

    /// Maps a remote task status string onto the local vocabulary.
    ///
    /// Unknown strings map to `Submitted`: the task exists but nothing more
    /// is known about it.
    #[must_use]
    pub fn from_task_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "registered" | "defined" | "assigning" | "ready" | "scouting" | "scouted"
            | "prepared" | "topreprocess" | "preprocessing" => Self::Submitting,
            "pending" => Self::Submitted,
            "running" | "toretry" | "toincexec" | "throttled" => Self::Running,
            "done" => Self::Finished,
            "finished" | "paused" => Self::SubFinished,
            "failed" | "exhausted" => Self::Failed,
            "aborted" => Self::Cancelled,
            "broken" => Self::Broken,
            _ => Self::Submitted,
        }
    }

    /// Returns the snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Ready => "ready",
            Self::Transforming => "transforming",
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::SubFinished => "sub_finished",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Suspended => "suspended",
            Self::Broken => "broken",
            Self::ToCancel => "to_cancel",
            Self::Cancelling => "cancelling",
            Self::ToSuspend => "to_suspend",
            Self::Suspending => "suspending",
            Self::ToResume => "to_resume",
            Self::Resuming => "resuming",
            Self::ToExpire => "to_expire",
            Self::Expiring => "expiring",
            Self::ToFinish => "to_finish",
            Self::ToForceFinish => "to_force_finish",
            Self::Terminating => "terminating",
            Self::FinishedOnStep => "finished_on_step",
            Self::FinishedOnExec => "finished_on_exec",
            Self::FinishedTerm => "finished_term",
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level claim flag used by agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locking {
    #[default]
    Idle,
    Locking,
}

/// Status of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    #[default]
    New,
    Open,
    Processing,
    Closed,
    SubClosed,
    Failed,
    Cancelled,
    Suspended,
}

/// Role of a collection within its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionRelationType {
    Input,
    Output,
    Log,
}

/// Terminal outcome counts over a set of works.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalCounts {
    pub total: u32,
    pub finished: u32,
    pub sub_finished: u32,
    pub failed: u32,
    pub expired: u32,
    pub cancelled: u32,
    pub suspended: u32,
}

impl TerminalCounts {
    /// Counts one work toward the total and its terminal bucket.
    pub fn record(&mut self, status: WorkStatus) {
        self.total += 1;
        match status {
            WorkStatus::Finished => self.finished += 1,
            WorkStatus::SubFinished
            | WorkStatus::FinishedOnStep
            | WorkStatus::FinishedOnExec
            | WorkStatus::FinishedTerm => self.sub_finished += 1,
            WorkStatus::Failed | WorkStatus::Broken => self.failed += 1,
            WorkStatus::Expired => self.expired += 1,
            WorkStatus::Cancelled => self.cancelled += 1,
            WorkStatus::Suspended => self.suspended += 1,
            _ => {}
        }
    }

    /// Builds counts from a sequence of statuses.
    pub fn from_statuses(statuses: impl IntoIterator<Item = WorkStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.record(status);
        }
        counts
    }

    /// Decides the aggregate terminal status.
    ///
    /// Priority is Finished > SubFinished > Failed > Expired > Cancelled >
    /// Suspended. An empty set counts as finished.
    #[must_use]
    pub fn aggregate(&self) -> WorkStatus {
        if self.finished == self.total {
            WorkStatus::Finished
        } else if self.finished + self.sub_finished > 0 {
            WorkStatus::SubFinished
        } else if self.failed > 0 {
            WorkStatus::Failed
        } else if self.expired > 0 {
            WorkStatus::Expired
        } else if self.cancelled > 0 {
            WorkStatus::Cancelled
        } else if self.suspended > 0 {
            WorkStatus::Suspended
        } else {
            WorkStatus::Failed
        }
    }
}

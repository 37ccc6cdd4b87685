use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseEnumError;

/// Kind of user content an analysis run is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Post,
    Reply,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Post => "post",
            SourceType::Reply => "reply",
        }
    }

    /// Backing table in the content store.
    pub fn table(&self) -> &'static str {
        match self {
            SourceType::Post => "posts",
            SourceType::Reply => "replies",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(SourceType::Post),
            "reply" => Ok(SourceType::Reply),
            other => Err(ParseEnumError::new("source_type", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Run status state machine
// ---------------------------------------------------------------------------

/// Lifecycle of an analysis run: `pending -> processing -> completed | failed`.
///
/// Recovery may force `processing` back to `pending` or forward to `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Transitions the worker may take. Recovery transitions are covered by
    /// [`reconcile`], not here.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Processing)
                | (RunStatus::Pending, RunStatus::Completed)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Processing, RunStatus::Completed)
                | (RunStatus::Processing, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "processing" => Ok(RunStatus::Processing),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(ParseEnumError::new("status", other)),
        }
    }
}

/// Outcome of reconciling one run found after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub status: RunStatus,
    pub note: Option<&'static str>,
}

pub const RECOVERED_NOTE: &str = "recovered: partial results kept after worker restart";
pub const RESET_NOTE: &str = "reset: no artifacts found after worker restart";

/// Decide what a run should become after a worker restart.
///
/// Only `processing` runs are orphans; anything else is left alone. An orphan
/// that already wrote artifacts is kept as `completed`, otherwise it goes back
/// to `pending` to be re-queued.
pub fn reconcile(status: RunStatus, has_artifacts: bool) -> Reconciliation {
    match (status, has_artifacts) {
        (RunStatus::Processing, true) => Reconciliation {
            status: RunStatus::Completed,
            note: Some(RECOVERED_NOTE),
        },
        (RunStatus::Processing, false) => Reconciliation {
            status: RunStatus::Pending,
            note: Some(RESET_NOTE),
        },
        (other, _) => Reconciliation {
            status: other,
            note: None,
        },
    }
}

// ---------------------------------------------------------------------------
// ADUs and relations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AduType {
    Claim,
    Premise,
    Conclusion,
}

impl AduType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AduType::Claim => "claim",
            AduType::Premise => "premise",
            AduType::Conclusion => "conclusion",
        }
    }
}

impl fmt::Display for AduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AduType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claim" | "major_claim" => Ok(AduType::Claim),
            "premise" => Ok(AduType::Premise),
            "conclusion" => Ok(AduType::Conclusion),
            _ => Err(ParseEnumError::new("adu_type", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Support,
    Attack,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Support => "support",
            RelationType::Attack => "attack",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "support" | "supports" => Ok(RelationType::Support),
            "attack" | "attacks" => Ok(RelationType::Attack),
            _ => Err(ParseEnumError::new("relation_type", s)),
        }
    }
}

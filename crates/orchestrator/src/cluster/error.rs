//! Cluster error types.

use std::fmt;

use itertools::Itertools;
use thiserror::Error;

use super::member::MemberId;

/// Errors raised by cluster operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    /// The member ran the task and reported an error.
    #[error("member {member} failed: {reason}")]
    MemberFailed { member: MemberId, reason: String },

    /// The member did not answer within the per-member timeout.
    #[error("member {member} timed out after {timeout_ms}ms")]
    MemberTimedOut { member: MemberId, timeout_ms: u64 },

    /// The member could not be reached.
    #[error("member {member} unreachable: {reason}")]
    MemberUnreachable { member: MemberId, reason: String },

    /// A broadcast failed on one or more members.
    #[error(
        "cluster broadcast failed on {} of {members} member(s) after {took_ms}ms: [{}]",
        .failures.len(),
        .failures.iter().join("; ")
    )]
    BroadcastFailed {
        failures: Vec<MemberFailure>,
        members: usize,
        took_ms: u64,
    },
}

impl ClusterError {
    /// Create a member failure.
    pub fn member_failed(member: MemberId, reason: impl Into<String>) -> Self {
        Self::MemberFailed {
            member,
            reason: reason.into(),
        }
    }

    /// Create an unreachable-member error.
    pub fn member_unreachable(member: MemberId, reason: impl Into<String>) -> Self {
        Self::MemberUnreachable {
            member,
            reason: reason.into(),
        }
    }

    /// Members that failed a broadcast.
    #[must_use]
    pub fn failed_members(&self) -> Vec<&MemberId> {
        match self {
            Self::BroadcastFailed { failures, .. } => failures.iter().map(|f| &f.member).collect(),
            Self::MemberFailed { member, .. }
            | Self::MemberTimedOut { member, .. }
            | Self::MemberUnreachable { member, .. } => vec![member],
        }
    }
}

/// One member's part of a failed broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFailure {
    /// Member that failed.
    pub member: MemberId,
    /// Why it failed.
    pub cause: ClusterError,
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)
    }
}

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

//! Cluster members and membership.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ClusterResult;
use super::resources::{ResourceBundle, ResourceCache};

/// Identity of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a member reports after running a broadcast task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Reporting member.
    pub member: MemberId,
    /// Informational message.
    pub message: String,
    /// Set when the task failed on the member.
    pub error: Option<String>,
}

impl TaskStatus {
    /// A successful status.
    pub fn ok(member: MemberId, message: impl Into<String>) -> Self {
        Self {
            member,
            message: message.into(),
            error: None,
        }
    }

    /// A failed status.
    pub fn failed(member: MemberId, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            member,
            message: message.into(),
            error: Some(error.into()),
        }
    }

    /// Check if the task succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A node that can run broadcast tasks.
#[async_trait]
pub trait ClusterMember: Send + Sync {
    /// Member identity.
    fn id(&self) -> &MemberId;

    /// Invalidate the resources covered by `bundle` on this member.
    async fn refresh_resources(&self, bundle: &ResourceBundle) -> ClusterResult<TaskStatus>;
}

/// Source of the current cluster membership.
pub trait ClusterTransport: Send + Sync {
    /// Every known member, including the local one.
    fn members(&self) -> Vec<Arc<dyn ClusterMember>>;
}

/// Fixed membership list.
#[derive(Clone, Default)]
pub struct StaticMembership {
    members: Vec<Arc<dyn ClusterMember>>,
}

impl StaticMembership {
    /// Membership over `members`.
    #[must_use]
    pub fn new(members: Vec<Arc<dyn ClusterMember>>) -> Self {
        Self { members }
    }

    /// Single-node membership.
    #[must_use]
    pub fn single(member: Arc<dyn ClusterMember>) -> Self {
        Self::new(vec![member])
    }
}

impl ClusterTransport for StaticMembership {
    fn members(&self) -> Vec<Arc<dyn ClusterMember>> {
        self.members.clone()
    }
}

impl fmt::Debug for StaticMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.members.iter().map(|m| m.id().clone()))
            .finish()
    }
}

/// The member running in this process.
#[derive(Debug)]
pub struct LocalMember {
    id: MemberId,
    cache: Arc<ResourceCache>,
}

impl LocalMember {
    /// Local member refreshing `cache`.
    #[must_use]
    pub fn new(id: MemberId, cache: Arc<ResourceCache>) -> Self {
        Self { id, cache }
    }

    /// The member's resource cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }
}

#[async_trait]
impl ClusterMember for LocalMember {
    fn id(&self) -> &MemberId {
        &self.id
    }

    async fn refresh_resources(&self, bundle: &ResourceBundle) -> ClusterResult<TaskStatus> {
        let dropped = self.cache.invalidate(bundle);
        Ok(TaskStatus::ok(
            self.id.clone(),
            format!("{}: refreshed {bundle}, dropped {dropped} cached resource(s)", self.id),
        ))
    }
}

//! Per-node cluster coordinator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::time::timeout;
use tracing::{debug, error, info};

use super::error::{ClusterError, ClusterResult, MemberFailure};
use super::member::{ClusterTransport, MemberId, TaskStatus};
use super::resources::ResourceBundle;
use crate::persistence::PersistenceResult;
use crate::store::{ClaimRequest, ClaimedJob, EngineStore};

/// Outcome of a broadcast that succeeded on every member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// One status per member, in membership order.
    pub statuses: Vec<TaskStatus>,
    /// Wall time until the last member answered.
    pub took_ms: u64,
}

/// Owns this node's handles to the cluster and the shared job store.
pub struct ClusterCoordinator {
    node_id: MemberId,
    store: Arc<dyn EngineStore>,
    transport: Arc<dyn ClusterTransport>,
    member_timeout: Duration,
}

impl ClusterCoordinator {
    /// Create the coordinator for `node_id`.
    #[must_use]
    pub fn new(
        node_id: MemberId,
        store: Arc<dyn EngineStore>,
        transport: Arc<dyn ClusterTransport>,
        member_timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            store,
            transport,
            member_timeout,
        }
    }

    /// This node's identity.
    #[must_use]
    pub fn node_id(&self) -> &MemberId {
        &self.node_id
    }

    /// Claim due jobs for this node.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be queried.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        misfire_grace: chrono::Duration,
    ) -> PersistenceResult<Vec<ClaimedJob>> {
        let request = ClaimRequest {
            node_id: self.node_id.as_str().to_string(),
            now,
            limit,
            misfire_grace,
        };
        self.store.claim_due(&request).await
    }

    /// Release claims this node held before it restarted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be updated.
    pub async fn release_orphaned_claims(&self, now: DateTime<Utc>) -> PersistenceResult<usize> {
        let released = self.store.recover_claimed(self.node_id.as_str(), now).await?;
        if released > 0 {
            info!(node_id = %self.node_id, released, "Recovered claims from previous run");
        }
        Ok(released)
    }

    /// Invalidate cached resources on every member.
    ///
    /// Every member's answer is awaited, bounded by the per-member timeout,
    /// before the outcome is decided.
    ///
    /// # Errors
    ///
    /// Returns `ClusterError::BroadcastFailed` listing every member that
    /// failed, timed out or was unreachable.
    pub async fn refresh_cluster_resources(
        &self,
        bundle: &ResourceBundle,
    ) -> ClusterResult<BroadcastReport> {
        let started = Instant::now();
        let members = self.transport.members();
        let timeout_ms = u64::try_from(self.member_timeout.as_millis()).unwrap_or(u64::MAX);

        debug!(bundle = %bundle, members = members.len(), "Broadcasting resource refresh");

        let tasks = members.iter().map(|member| async move {
            let id = member.id().clone();
            let outcome = match timeout(self.member_timeout, member.refresh_resources(bundle)).await
            {
                Ok(Ok(status)) => match &status.error {
                    None => Ok(status),
                    Some(reason) => Err(ClusterError::member_failed(id.clone(), reason.clone())),
                },
                Ok(Err(err)) => Err(err),
                Err(_) => Err(ClusterError::MemberTimedOut {
                    member: id.clone(),
                    timeout_ms,
                }),
            };
            (id, outcome)
        });
        let outcomes = join_all(tasks).await;
        let took_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut statuses = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (member, outcome) in outcomes {
            match outcome {
                Ok(status) => {
                    info!(member = %member, "{}", status.message);
                    statuses.push(status);
                }
                Err(cause) => failures.push(MemberFailure { member, cause }),
            }
        }

        if failures.is_empty() {
            info!(bundle = %bundle, members = statuses.len(), took_ms, "Cluster refresh complete");
            return Ok(BroadcastReport { statuses, took_ms });
        }

        let err = ClusterError::BroadcastFailed {
            failures,
            members: members.len(),
            took_ms,
        };
        error!(bundle = %bundle, took_ms, error = %err, "Cluster refresh failed");
        Err(err)
    }
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("node_id", &self.node_id)
            .field("member_timeout", &self.member_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unreachable)]

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cluster::{ClusterMember, LocalMember, ResourceCache, StaticMembership};
    use crate::store::InMemoryStore;

    struct ScriptedMember {
        id: MemberId,
        fail: Option<ClusterError>,
        delay: Duration,
        finished: AtomicBool,
    }

    impl ScriptedMember {
        fn new(id: &str, fail: Option<ClusterError>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: MemberId::new(id),
                fail,
                delay,
                finished: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ClusterMember for ScriptedMember {
        fn id(&self) -> &MemberId {
            &self.id
        }

        async fn refresh_resources(&self, _bundle: &ResourceBundle) -> ClusterResult<TaskStatus> {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(TaskStatus::ok(self.id.clone(), "refreshed")),
            }
        }
    }

    fn coordinator(members: Vec<Arc<dyn ClusterMember>>, member_timeout: Duration) -> ClusterCoordinator {
        ClusterCoordinator::new(
            MemberId::new("node-1"),
            Arc::new(InMemoryStore::new()),
            Arc::new(StaticMembership::new(members)),
            member_timeout,
        )
    }

    #[tokio::test]
    async fn test_refresh_succeeds_on_every_member() {
        let cache = Arc::new(ResourceCache::new());
        cache.insert("definition", "def-1", vec![1]);
        let local = Arc::new(LocalMember::new(MemberId::new("node-1"), Arc::clone(&cache)));
        let remote = ScriptedMember::new("node-2", None, Duration::ZERO);
        let coordinator = coordinator(
            vec![local as Arc<dyn ClusterMember>, remote],
            Duration::from_secs(1),
        );

        let report = coordinator
            .refresh_cluster_resources(&ResourceBundle::scoped("definition", "def-1"))
            .await
            .unwrap();

        assert_eq!(report.statuses.len(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_member_fails_broadcast_after_all_finish() {
        let m1 = ScriptedMember::new("node-1", None, Duration::from_millis(20));
        let m2 = ScriptedMember::new(
            "node-2",
            Some(ClusterError::member_failed(MemberId::new("node-2"), "compile error")),
            Duration::ZERO,
        );
        let m3 = ScriptedMember::new("node-3", None, Duration::from_millis(20));
        let coordinator = coordinator(
            vec![
                m1.clone() as Arc<dyn ClusterMember>,
                m2 as Arc<dyn ClusterMember>,
                m3.clone() as Arc<dyn ClusterMember>,
            ],
            Duration::from_secs(1),
        );

        let err = coordinator
            .refresh_cluster_resources(&ResourceBundle::Global)
            .await
            .unwrap_err();

        assert_eq!(err.failed_members(), vec![&MemberId::new("node-2")]);
        assert!(err.to_string().contains("compile error"));
        assert!(m1.finished.load(Ordering::SeqCst));
        assert!(m3.finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_slow_member_counts_as_failure() {
        let fast = ScriptedMember::new("node-1", None, Duration::ZERO);
        let slow = ScriptedMember::new("node-2", None, Duration::from_secs(5));
        let coordinator = coordinator(
            vec![fast as Arc<dyn ClusterMember>, slow],
            Duration::from_millis(20),
        );

        let err = coordinator
            .refresh_cluster_resources(&ResourceBundle::Global)
            .await
            .unwrap_err();

        let ClusterError::BroadcastFailed { failures, .. } = err else {
            unreachable!("expected aggregate failure");
        };
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            failures[0].cause,
            ClusterError::MemberTimedOut { timeout_ms: 20, .. }
        ));
    }

    #[tokio::test]
    async fn test_unreachable_and_failed_members_both_reported() {
        let m1 = ScriptedMember::new(
            "node-1",
            Some(ClusterError::member_unreachable(MemberId::new("node-1"), "connection refused")),
            Duration::ZERO,
        );
        let m2 = ScriptedMember::new(
            "node-2",
            Some(ClusterError::member_failed(MemberId::new("node-2"), "boom")),
            Duration::ZERO,
        );
        let coordinator = coordinator(
            vec![m1 as Arc<dyn ClusterMember>, m2],
            Duration::from_secs(1),
        );

        let err = coordinator
            .refresh_cluster_resources(&ResourceBundle::Global)
            .await
            .unwrap_err();

        assert_eq!(err.failed_members().len(), 2);
    }
}

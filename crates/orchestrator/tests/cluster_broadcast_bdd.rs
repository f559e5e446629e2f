//! BDD tests: broadcasting a resource refresh to every cluster member.
//!
//! **Scenario:** GIVEN a three-member cluster WHEN member 2 fails the
//! refresh THEN the caller gets an error naming member 2, after members 1
//! and 3 have still refreshed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use orchestrator::cluster::{
    ClusterCoordinator, ClusterError, ClusterMember, ClusterResult, LocalMember, MemberId,
    ResourceBundle, ResourceCache, StaticMembership, TaskStatus,
};
use orchestrator::store::InMemoryStore;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// A remote member whose answer is scripted.
struct ScriptedMember {
    id: MemberId,
    answer: Answer,
    calls: AtomicUsize,
}

enum Answer {
    Fail(&'static str),
    Hang,
}

#[async_trait]
impl ClusterMember for ScriptedMember {
    fn id(&self) -> &MemberId {
        &self.id
    }

    async fn refresh_resources(&self, _bundle: &ResourceBundle) -> ClusterResult<TaskStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answer {
            Answer::Fail(reason) => Ok(TaskStatus::failed(
                self.id.clone(),
                format!("{}: refresh failed", self.id),
                reason,
            )),
            Answer::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(TaskStatus::ok(self.id.clone(), "late"))
            }
        }
    }
}

fn local(id: &str) -> (Arc<LocalMember>, Arc<ResourceCache>) {
    let cache = Arc::new(ResourceCache::new());
    cache.insert("process-definition", "invoice", vec![1, 2, 3]);
    (
        Arc::new(LocalMember::new(MemberId::new(id), cache.clone())),
        cache,
    )
}

fn coordinator(members: Vec<Arc<dyn ClusterMember>>, timeout: Duration) -> ClusterCoordinator {
    ClusterCoordinator::new(
        MemberId::new("member-1"),
        Arc::new(InMemoryStore::new()),
        Arc::new(StaticMembership::new(members)),
        timeout,
    )
}

#[tokio::test]
async fn given_three_members_when_member_two_fails_then_error_names_it_and_others_refreshed(
) -> TestResult {
    // Given: members 1 and 3 hold a cached definition, member 2 will fail
    let (first, first_cache) = local("member-1");
    let second = Arc::new(ScriptedMember {
        id: MemberId::new("member-2"),
        answer: Answer::Fail("cache locked"),
        calls: AtomicUsize::new(0),
    });
    let (third, third_cache) = local("member-3");
    let cluster = coordinator(
        vec![first as Arc<dyn ClusterMember>, second.clone(), third],
        Duration::from_secs(1),
    );

    // When: the definition is refreshed cluster-wide
    let err = cluster
        .refresh_cluster_resources(&ResourceBundle::scoped("process-definition", "invoice"))
        .await
        .err()
        .ok_or("broadcast should fail")?;

    // Then: the error names member 2 and only member 2
    assert_eq!(err.failed_members(), vec![&MemberId::new("member-2")]);
    assert!(err.to_string().contains("cache locked"), "{err}");
    assert!(matches!(err, ClusterError::BroadcastFailed { members: 3, .. }));

    // And: every member was asked, and members 1 and 3 refreshed
    assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    assert!(first_cache.is_empty());
    assert!(third_cache.is_empty());
    Ok(())
}

#[tokio::test]
async fn given_member_hangs_when_broadcast_then_timeout_reported_with_other_failures(
) -> TestResult {
    // Given: one hanging member and one failing member
    let (first, _) = local("member-1");
    let hanging = Arc::new(ScriptedMember {
        id: MemberId::new("member-2"),
        answer: Answer::Hang,
        calls: AtomicUsize::new(0),
    });
    let failing = Arc::new(ScriptedMember {
        id: MemberId::new("member-3"),
        answer: Answer::Fail("disk full"),
        calls: AtomicUsize::new(0),
    });
    let cluster = coordinator(
        vec![first as Arc<dyn ClusterMember>, hanging, failing],
        Duration::from_millis(50),
    );

    // When: a global refresh is broadcast
    let err = cluster
        .refresh_cluster_resources(&ResourceBundle::Global)
        .await
        .err()
        .ok_or("broadcast should fail")?;

    // Then: both failures are reported, the hang as a timeout
    let ClusterError::BroadcastFailed { failures, .. } = &err else {
        return Err(format!("unexpected error: {err:?}").into());
    };
    assert_eq!(failures.len(), 2);
    assert!(matches!(
        failures[0].cause,
        ClusterError::MemberTimedOut { timeout_ms: 50, .. }
    ));
    assert_eq!(failures[1].member, MemberId::new("member-3"));
    Ok(())
}

#[tokio::test]
async fn given_healthy_cluster_when_broadcast_then_one_status_per_member() -> TestResult {
    // Given: two healthy local members
    let (first, _) = local("member-1");
    let (second, _) = local("member-2");
    let cluster = coordinator(
        vec![first as Arc<dyn ClusterMember>, second],
        Duration::from_secs(1),
    );

    // When: a global refresh is broadcast
    let report = cluster
        .refresh_cluster_resources(&ResourceBundle::Global)
        .await?;

    // Then: every member reports success, in membership order
    let members: Vec<_> = report.statuses.iter().map(|s| s.member.clone()).collect();
    assert_eq!(members, vec![MemberId::new("member-1"), MemberId::new("member-2")]);
    assert!(report.statuses.iter().all(TaskStatus::is_ok));
    Ok(())
}

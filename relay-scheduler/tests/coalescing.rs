//! Drives a genuine concurrent admission race across many tasks, rather than the
//! sequential two-caller case already covered by the crate's inline unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relay_scheduler::{Admission, Scheduler};
use relay_session::Session;
use relay_types::{CallOutcome, RequestId, SessionId, Transport};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn session() -> Arc<Session> {
    Arc::new(Session {
        id: SessionId::new("s1"),
        transport: Transport::Stdio,
        created_at: chrono::Utc::now(),
        semaphore: Arc::new(Semaphore::new(32)),
        cancellation: CancellationToken::new(),
    })
}

/// Ten concurrent `call_tool`s with identical arguments yield exactly one admitted
/// leader and nine coalesced followers, all of which observe the leader's outcome.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_concurrent_identical_calls_coalesce_into_one_admission() {
    let scheduler = Arc::new(Scheduler::new(32, 32, HashSet::new()));
    let session = session();
    let fingerprint = scheduler.compute_fingerprint("slow_echo", &json!({"msg": "x"}));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..10 {
        let scheduler = scheduler.clone();
        let session = session.clone();
        let fingerprint = fingerprint.clone();
        tasks.spawn(async move {
            let deadline = Instant::now() + Duration::from_secs(5);
            scheduler
                .admit(&fingerprint, &RequestId::new(format!("r{i}")), None, &session, deadline)
                .await
                .unwrap()
        });
    }

    let mut admissions = Vec::new();
    while let Some(res) = tasks.join_next().await {
        admissions.push(res.unwrap());
    }

    let mut leader_guard = None;
    let mut followers = Vec::new();
    for admission in admissions {
        match admission {
            Admission::Leader(guard) => {
                assert!(leader_guard.is_none(), "more than one call became leader for the same fingerprint");
                leader_guard = Some(guard);
            }
            Admission::Follower { wait, leader_request_id } => followers.push((wait, leader_request_id)),
        }
    }

    let leader_guard = leader_guard.expect("exactly one of the ten calls should have become leader");
    assert_eq!(followers.len(), 9, "the remaining nine calls should all coalesce onto the leader");

    let first_leader_id = followers[0].1.clone();
    assert!(
        followers.iter().all(|(_, id)| *id == first_leader_id),
        "every follower should report the same leader request id"
    );

    let outcome = CallOutcome::Ok { payload: json!({"reply": "x"}) };
    scheduler.complete(leader_guard.fingerprint(), outcome.clone());
    drop(leader_guard);

    for (wait, _) in followers {
        let received = wait.wait().await;
        assert!(matches!(received, CallOutcome::Ok { payload } if payload == json!({"reply": "x"})));
    }
}

/// A call whose fingerprint disables coalescing (empty fingerprint) never joins any
/// other call as a follower, even when run alongside identical-looking calls.
#[tokio::test]
async fn disabled_coalescing_never_produces_a_follower() {
    let mut disabled = HashSet::new();
    disabled.insert("no_coalesce".to_string());
    let scheduler = Scheduler::new(8, 8, disabled);
    let session = session();
    let fp = scheduler.compute_fingerprint("no_coalesce", &json!({"msg": "x"}));
    assert_eq!(fp, "");

    let deadline = Instant::now() + Duration::from_secs(5);
    let first = scheduler.admit(&fp, &RequestId::new("r1"), None, &session, deadline).await.unwrap();
    let second = scheduler.admit(&fp, &RequestId::new("r2"), None, &session, deadline).await.unwrap();

    assert!(matches!(first, Admission::Leader(_)));
    assert!(matches!(second, Admission::Leader(_)));
}

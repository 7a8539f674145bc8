mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use replikv::error::JoinError;
use replikv::ClusterState;
use replikv::Config;
use replikv::State;

use fixtures::addr_of;
use fixtures::RaftRouter;

/// `RAFT.CLUSTER JOIN` through a follower.
///
/// The joining node first contacts a follower, which answers MOVED with
/// the leader's address; the join walk follows the redirect, the leader
/// commits the membership change, and the new node comes up as a
/// follower with the cluster's data.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn join_follows_moved_redirect() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let mut want = router.build_cluster(1, &[2]).await?;

    router.client_set_many(1, "seed", 5).await;
    want += 5;
    router.wait_for_log(&btreeset![1, 2], want, Some(Duration::from_secs(5)), "seed writes").await?;

    tracing::info!("--- node 3 joins via the follower's address");
    router.new_raft_node(3).await;
    let raft3 = router.get_raft_handle(&3).await?;
    raft3.cluster_join(vec![addr_of(2)]).await?;

    router
        .wait_for_metrics(&3, |m| m.cluster_state == ClusterState::Up, Some(Duration::from_secs(5)), "n3 up")
        .await?;
    router.wait_for_state(&btreeset![3], State::Follower, Some(Duration::from_secs(5)), "n3 follower").await?;

    want += 1; // The join's membership entry.
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(10)), "n3 caught up").await?;
    router.assert_identical_datasets(&btreeset![1, 2, 3]).await;

    // The joined node carries the cluster's dbid.
    let info1 = router.get_raft_handle(&1).await?.info().await?;
    let info3 = raft3.info().await?;
    assert_eq!(info1.dbid, info3.dbid);

    Ok(())
}

/// A join list with only unreachable addresses fails with a timeout after
/// one full pass, and the node returns to Uninitialized.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_with_unreachable_addresses_times_out() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    router.new_raft_node(1).await;
    let raft = router.get_raft_handle(&1).await?;

    let err = raft.cluster_join(vec![addr_of(98), addr_of(99)]).await.unwrap_err();
    assert!(matches!(err, JoinError::Timeout), "expected Timeout, got {:?}", err);

    router
        .wait_for_metrics(
            &1,
            |m| m.cluster_state == ClusterState::Uninitialized,
            Some(Duration::from_secs(5)),
            "n1 back to uninitialized",
        )
        .await?;

    Ok(())
}

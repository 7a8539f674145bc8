mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use maplit::btreeset;
use replikv::Config;

use fixtures::RaftRouter;

/// Leader failover.
///
/// After the leader of a three-node cluster is cut off, a follower is
/// elected, the committed log survives intact on the new leader, and new
/// writes commit. When the old leader comes back it rejoins as a follower
/// and converges.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_failover() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    let mut want = router.build_cluster(1, &[2, 3]).await?;

    router.client_set_many(1, "key", 10).await;
    want += 10;
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(10)), "initial writes").await?;

    // Capture the committed log as the old leader held it.
    let old_leader_entries = router.get_storage_handle(&1).await?.get_log_entries(..).await?;

    tracing::info!("--- isolating the leader");
    router.isolate_node(1).await;

    let new_leader = router.wait_for_leader(Duration::from_secs(10), "failover election").await?;
    assert!(
        btreeset![2, 3].contains(&new_leader),
        "expected a follower to take over, got {}",
        new_leader
    );

    // The new leader's committed log matches the old leader's through the
    // last committed index.
    let new_leader_entries = router.get_storage_handle(&new_leader).await?.get_log_entries(1..=want).await?;
    assert_eq!(old_leader_entries, new_leader_entries);

    tracing::info!("--- writing at the new leader");
    router.client_set(new_leader, "after-failover", "yes").await;
    // The new leader committed a blank entry on election, then our write.
    want += 2;
    router.wait_for_log(&btreeset![2, 3], want, Some(Duration::from_secs(10)), "post-failover writes").await?;

    tracing::info!("--- restoring the old leader");
    router.restore_node(1).await;
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(10)), "old leader converged").await?;

    let metrics = router.wait_for_metrics(&1, |_| true, None, "old leader metrics").await?;
    if metrics.state == replikv::State::Leader {
        return Err(anyhow!("deposed leader did not step down"));
    }

    router.assert_identical_datasets(&btreeset![1, 2, 3]).await;

    // Terms along every converged log are non-decreasing, and the logs are
    // identical across the cluster.
    let reference = router.get_storage_handle(&1).await?.get_log_entries(..).await?;
    for pair in reference.windows(2) {
        assert!(
            pair[0].log_id.term <= pair[1].log_id.term,
            "terms must be non-decreasing: {} then {}",
            pair[0].log_id,
            pair[1].log_id
        );
    }
    for id in [2u64, 3] {
        let entries = router.get_storage_handle(&id).await?.get_log_entries(..).await?;
        assert_eq!(reference, entries, "node {} diverged from node 1", id);
    }

    Ok(())
}

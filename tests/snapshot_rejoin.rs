mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use replikv::Config;
use replikv::LogId;

use fixtures::RaftRouter;

/// Snapshot catch-up of a node that lost its disk.
///
/// A three-node cluster commits entries, loses node 3, commits more and
/// compacts the log past what node 3 ever saw. Node 3 then restarts with
/// blank storage: the leader can no longer feed it entries and must
/// stream a snapshot, after which node 3 converges to the leader's exact
/// state.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn rejoin_via_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).max_log_entries(20).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    let mut want = router.build_cluster(1, &[2, 3]).await?;

    tracing::info!("--- writing the first batch");
    router.client_set_many(1, "a", 30).await;
    want += 30;
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(10)), "first batch").await?;

    tracing::info!("--- killing node 3");
    router.remove_node(3).await;

    tracing::info!("--- writing the second batch");
    router.client_set_many(1, "b", 30).await;
    want += 30;
    router.wait_for_log(&btreeset![1, 2], want, Some(Duration::from_secs(10)), "second batch").await?;

    tracing::info!("--- compacting the leader log past node 3's position");
    let raft = router.get_raft_handle(&1).await?;
    let covered = raft.compact().await?;
    assert_eq!(covered.index, want);

    tracing::info!("--- restarting node 3 with blank storage");
    router.new_raft_node_with_blank_storage(3).await;

    router.wait_for_log(&btreeset![3], want, Some(Duration::from_secs(15)), "node 3 caught up").await?;
    router
        .wait_for_snapshot(&btreeset![3], LogId::new(1, want), Some(Duration::from_secs(5)), "node 3 snapshot")
        .await?;

    tracing::info!("--- the cluster keeps moving with node 3 back");
    router.client_set_many(1, "c", 5).await;
    want += 5;
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(10)), "final writes").await?;

    router.assert_identical_datasets(&btreeset![1, 2, 3]).await;

    Ok(())
}

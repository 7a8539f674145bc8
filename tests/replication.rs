mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use replikv::Config;

use fixtures::RaftRouter;

/// Three-node replication.
///
/// Builds a cluster of three (one init plus two membership entries),
/// writes 100 commands at the leader, and asserts every node applies all
/// 102 entries in the same order, ending with identical datasets.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn three_node_replication() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    tracing::info!("--- building a three node cluster");
    let want = router.build_cluster(1, &[2, 3]).await?;
    assert_eq!(want, 2, "two membership entries");

    tracing::info!("--- writing 100 commands at the leader");
    router.client_set_many(1, "key", 100).await;

    let want = want + 100;
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(10)), "all nodes applied").await?;

    // Two membership entries plus one hundred data entries.
    assert_eq!(want, 102);
    router.assert_stable_cluster(Some(1), Some(want)).await;
    router.assert_identical_datasets(&btreeset![1, 2, 3]).await;

    Ok(())
}

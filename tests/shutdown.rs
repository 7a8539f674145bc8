mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use replikv::ClientWriteError;
use replikv::Config;
use replikv::RaftError;

use fixtures::RaftRouter;

/// Shutdown fails pending requests.
///
/// A write that can not commit (the only follower is cut off) is answered
/// with a shutdown error when the leader goes down, rather than being
/// left hanging.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_fails_pending_requests() -> Result<()> {
    fixtures::init_tracing();

    // Slow elections so the isolated follower does not campaign during
    // the test window.
    let config = Arc::new(
        Config::build("test".into()).election_timeout_min(2000).election_timeout_max(3000).validate()?,
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster(1, &[2]).await?;

    router.isolate_node(2).await;

    let pending = {
        let router = router.clone();
        tokio::spawn(async move { router.try_client_set(1, "stuck", "v").await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    tracing::info!("--- shutting the leader down with a write pending");
    let raft = router.get_raft_handle(&1).await?;
    raft.shutdown().await?;

    let res = pending.await?;
    match res {
        Err(ClientWriteError::RaftError(RaftError::ShuttingDown)) => {}
        other => panic!("expected a shutdown error for the pending write, got {:?}", other),
    }

    Ok(())
}

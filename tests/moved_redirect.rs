mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use replikv::store::KvResponse;
use replikv::ClientWriteError;
use replikv::Config;
use replikv::State;

use fixtures::addr_of;
use fixtures::RaftRouter;

/// MOVED redirect.
///
/// A client command sent to a follower is answered with an error naming
/// the leader's id and address; resending to that address commits.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_to_follower_is_redirected() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    router.build_cluster(1, &[2]).await?;
    router.wait_for_state(&btreeset![2], State::Follower, Some(Duration::from_secs(5)), "n2 follower").await?;
    router
        .wait_for_metrics(&2, |m| m.current_leader == Some(1), Some(Duration::from_secs(5)), "n2 knows leader")
        .await?;

    tracing::info!("--- writing against the follower");
    let err = router.try_client_set(2, "k", "v").await.unwrap_err();
    match err {
        ClientWriteError::ForwardToLeader { leader_id, leader_addr } => {
            assert_eq!(leader_id, Some(1));
            assert_eq!(leader_addr, Some(addr_of(1)));
        }
        other => panic!("expected ForwardToLeader, got {:?}", other),
    }

    // The follower's log was not touched by the rejected command.
    let storage = router.get_storage_handle(&2).await?;
    let before = storage.get_log_entries(..).await?.len();

    tracing::info!("--- resending to the leader commits");
    assert_eq!(router.try_client_set(1, "k", "v").await.unwrap(), KvResponse::Ok);
    assert_eq!(
        router.client_get(1, "k").await.unwrap(),
        KvResponse::Value(Some(b"v".to_vec()))
    );

    let after = storage.get_log_entries(..).await?.len();
    assert!(after >= before, "follower only grows through replication");

    Ok(())
}

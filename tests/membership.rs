mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use replikv::error::ChangeConfigError;
use replikv::error::ResponseError;
use replikv::Config;
use replikv::State;

use fixtures::addr_of;
use fixtures::RaftRouter;

fn slow_election_config() -> Result<Arc<Config>> {
    // Elections slow enough that a briefly isolated follower does not
    // campaign while the test holds a membership change in flight.
    Ok(Arc::new(
        Config::build("test".into()).election_timeout_min(2000).election_timeout_max(3000).validate()?,
    ))
}

/// Only one membership change may be uncommitted at a time; a second
/// AddNode while one is in flight is rejected.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_change_while_in_flight_is_rejected() -> Result<()> {
    fixtures::init_tracing();

    let router = Arc::new(RaftRouter::new(slow_election_config()?));
    router.build_cluster(1, &[2]).await?;

    // With the only follower cut off, a new change can not commit.
    router.isolate_node(2).await;

    let raft = router.get_raft_handle(&1).await?;
    let pending = {
        let raft = raft.clone();
        tokio::spawn(async move { raft.add_node(3, addr_of(3)).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    tracing::info!("--- proposing a second change while the first is pending");
    let err = raft.add_node(4, addr_of(4)).await.unwrap_err();
    assert!(
        matches!(err, ResponseError::ChangeConfig(ChangeConfigError::ChangeInProgress)),
        "expected ChangeInProgress, got {:?}",
        err
    );

    tracing::info!("--- restoring the follower lets the first change commit");
    router.restore_node(2).await;
    pending.await?.map_err(|err| anyhow::anyhow!("{}", err))?;

    router
        .wait_for_metrics(
            &2,
            |m| m.membership_config.contains(&3),
            Some(Duration::from_secs(5)),
            "n2 sees node 3",
        )
        .await?;

    Ok(())
}

/// Removing a member steps it out of the cluster; the remainder keeps
/// accepting writes.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn remove_member_steps_node_out() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));
    let mut want = router.build_cluster(1, &[2, 3]).await?;

    tracing::info!("--- removing node 3");
    router.remove_member(1, 3).await?;
    want += 1;

    router.wait_for_state(&btreeset![3], State::NonVoter, Some(Duration::from_secs(5)), "n3 stepped out").await?;
    router
        .wait_for_metrics(
            &1,
            |m| !m.membership_config.contains(&3),
            Some(Duration::from_secs(5)),
            "n1 config without n3",
        )
        .await?;

    tracing::info!("--- the two remaining nodes keep committing");
    router.client_set_many(1, "post-remove", 5).await;
    want += 5;
    router.wait_for_log(&btreeset![1, 2], want, Some(Duration::from_secs(10)), "writes after removal").await?;

    Ok(())
}

/// Config error surface: removing an unknown node and removing the last
/// node are both rejected; re-adding an existing member at the same
/// address is an idempotent success.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn config_change_error_surface() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(RaftRouter::new(config));

    router.new_raft_node(1).await;
    router.init_node(1).await?;
    router.wait_for_state(&btreeset![1], State::Leader, None, "n1 leader").await?;
    let raft = router.get_raft_handle(&1).await?;

    let err = raft.remove_node(5).await.unwrap_err();
    assert!(
        matches!(err, ResponseError::ChangeConfig(ChangeConfigError::NodeNotFound(5))),
        "expected NodeNotFound, got {:?}",
        err
    );

    let err = raft.remove_node(1).await.unwrap_err();
    assert!(
        matches!(err, ResponseError::ChangeConfig(ChangeConfigError::InoperableConfig)),
        "expected InoperableConfig, got {:?}",
        err
    );

    // Growing to two nodes, then re-adding node 2 is a no-op success.
    router.new_raft_node(2).await;
    router.add_node(1, 2).await?;
    raft.add_node(2, addr_of(2)).await.map_err(|err| anyhow::anyhow!("{}", err))?;

    Ok(())
}

//! End-to-end canary rollouts through the runtime

mod common;

use chrono::Utc;
use common::{harness, plugin, Harness};
use std::path::PathBuf;
use std::time::Duration;
use warden_host::api::{
    kinds, topics, PluginDescriptor, PluginHealthSnapshot, PluginState, RolloutState,
};
use warden_host::{EventFilter, RolloutError, RolloutRequest};

async fn running_v1(h: &Harness) -> PathBuf {
    let v1 = h.package(plugin("search").system().trusted());
    h.runtime.coordinator.load_plugin(&v1).await.unwrap();
    h.package(PluginDescriptor::new("search", "2.0.0", "search.wasm").system().trusted())
}

#[tokio::test]
async fn test_quarter_batches_promote_new_version() {
    let h = harness();
    let advanced = h.record(EventFilter::topic(topics::ROLLOUT).with_type(kinds::BATCH_ADVANCED));
    let v2 = running_v1(&h).await;

    let status = h
        .runtime
        .rollouts
        .start_rollout(RolloutRequest::new("search", "2.0.0", &v2).with_batch_size(25))
        .await
        .unwrap();
    assert_eq!(status.state, RolloutState::Initialized);
    assert_eq!(status.current_version, "1.0.0");

    let mut percentages = Vec::new();
    let mut last = status;
    for _ in 0..4 {
        last = h.runtime.rollouts.advance("search").await.unwrap();
        percentages.push(last.current_percentage);
    }
    assert_eq!(percentages, vec![25, 50, 75, 100]);
    assert_eq!(last.state, RolloutState::Completed);
    assert_eq!(last.current_version, "2.0.0");
    assert!(last.finished_at.is_some());
    assert_eq!(advanced.lock().unwrap().len(), 4);

    let record = h.runtime.coordinator.plugin("search").await.unwrap();
    assert_eq!(record.version(), "2.0.0");
    assert_eq!(record.state, PluginState::Started);

    // Terminal rollouts refuse further steps but allow a new rollout
    assert!(matches!(
        h.runtime.rollouts.advance("search").await,
        Err(RolloutError::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.runtime
            .rollouts
            .start_rollout(RolloutRequest::new("search", "2.0.0", &v2))
            .await,
        Err(RolloutError::SameVersion { .. })
    ));
}

#[tokio::test]
async fn test_unhealthy_canary_rolls_back() {
    let h = harness();
    let failed = h.record(EventFilter::topic(topics::ROLLOUT).with_type(kinds::ROLLOUT_FAILED));
    let rolled_back = h.record(EventFilter::topic(topics::ROLLOUT).with_type(kinds::ROLLED_BACK));
    let v2 = running_v1(&h).await;

    h.runtime
        .rollouts
        .start_rollout(RolloutRequest::new("search", "2.0.0", &v2).with_batch_size(25))
        .await
        .unwrap();
    let first = h.runtime.rollouts.advance("search").await.unwrap();
    assert_eq!(first.current_percentage, 25);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut canary = PluginHealthSnapshot::new("search", "2.0.0", PluginState::Started);
    canary.healthy = false;
    canary.checked_at = Utc::now();
    h.runtime.monitor.report_instance(canary);

    let status = h.runtime.rollouts.advance("search").await.unwrap();
    assert_eq!(status.state, RolloutState::Failed);
    assert_eq!(status.current_percentage, 25);
    assert_eq!(failed.lock().unwrap().len(), 1);

    let rolled_back = rolled_back.lock().unwrap();
    assert_eq!(rolled_back.len(), 1);
    assert_eq!(rolled_back[0].version.as_deref(), Some("1.0.0"));

    let record = h.runtime.coordinator.plugin("search").await.unwrap();
    assert_eq!(record.version(), "1.0.0");
    assert_eq!(record.state, PluginState::Started);
}

#[tokio::test]
async fn test_healthy_observations_of_old_version_do_not_count() {
    let h = harness();
    let v2 = running_v1(&h).await;

    h.runtime
        .rollouts
        .start_rollout(RolloutRequest::new("search", "2.0.0", &v2).with_batch_size(50))
        .await
        .unwrap();
    h.runtime.rollouts.advance("search").await.unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut stable = PluginHealthSnapshot::new("search", "1.0.0", PluginState::Started);
    stable.healthy = false;
    stable.checked_at = Utc::now();
    h.runtime.monitor.report_instance(stable);

    let status = h.runtime.rollouts.advance("search").await.unwrap();
    assert_eq!(status.state, RolloutState::Completed);
}

#[tokio::test]
async fn test_tick_drives_rollout_after_window() {
    let h = harness();
    let v2 = running_v1(&h).await;

    h.runtime
        .rollouts
        .start_rollout(
            RolloutRequest::new("search", "2.0.0", &v2)
                .with_batch_size(50)
                .with_validate_window(Duration::from_millis(50)),
        )
        .await
        .unwrap();

    let changed = h.runtime.rollouts.tick().await;
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].current_percentage, 50);

    // Window not yet elapsed
    assert!(h.runtime.rollouts.tick().await.is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let changed = h.runtime.rollouts.tick().await;
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].state, RolloutState::Completed);
    assert_eq!(
        h.runtime.coordinator.plugin("search").await.unwrap().version(),
        "2.0.0"
    );
}

#[tokio::test]
async fn test_rollout_of_unknown_plugin_is_rejected() {
    let h = harness();
    let err = h
        .runtime
        .rollouts
        .start_rollout(RolloutRequest::new("ghost", "2.0.0", "/pkgs/ghost"))
        .await
        .unwrap_err();
    assert!(matches!(err, RolloutError::UnknownPlugin(_)));
    assert!(h.runtime.rollouts.statuses().is_empty());
}

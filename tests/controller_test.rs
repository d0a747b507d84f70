//! Controller-level behavior: setup command dispatch and wire shape,
//! aggregate health, and graceful shutdown.

mod common;

use std::time::Duration;

use common::{drain_commands, publish_heartbeat, request_a_to_b, testbed, wait_for};
use lightpathd::bus::Record;
use lightpathd::{ConnectionStatus, ControllerError, ResourceStore as _};

/// The separate setup call sends one `setupConnection` per endpoint
/// with the slot-derived channel frequency and the endpoint direction.
#[tokio::test]
async fn setup_dispatch_programs_both_endpoints() {
    let bed = testbed().await;
    let response = bed
        .controller
        .create_connection(request_a_to_b())
        .await
        .unwrap();
    drain_commands(&bed.broker, &bed.config.config_topic).await;

    bed.controller
        .setup_connection(&response.connection_id)
        .await
        .unwrap();

    let records = drain_commands(&bed.broker, &bed.config.config_topic).await;
    let setups: Vec<&Record> = records
        .iter()
        .filter(|r| r.value["type"] == "setupConnection")
        .collect();
    assert_eq!(setups.len(), 2);

    let directions: Vec<&str> = setups
        .iter()
        .map(|r| r.value["parameters"]["direction"].as_str().unwrap())
        .collect();
    assert!(directions.contains(&"source"));
    assert!(directions.contains(&"destination"));

    for setup in &setups {
        assert_eq!(
            setup.value["connection_id"].as_str().unwrap(),
            response.connection_id.as_str()
        );
        assert_eq!(setup.value["parameters"]["modulation"], "DP-16QAM");
        assert!(setup.key.is_some(), "setup commands are keyed");
        // 8 slots from index 0: center at 191300 + 4 * 12.5 GHz.
        let freq = setup.value["parameters"]["frequency"].as_f64().unwrap();
        assert!((freq - 191_350.0).abs() < 1e-9);
        assert_eq!(
            setup.value["parameters"]["path_info"]["links"][0],
            "link-ab"
        );
    }
}

/// Setup dispatch is only legal while the connection awaits setup.
#[tokio::test]
async fn setup_dispatch_requires_setup_in_progress() {
    let bed = testbed().await;
    let response = bed
        .controller
        .create_connection(request_a_to_b())
        .await
        .unwrap();
    bed.controller
        .complete_setup(&response.connection_id)
        .await
        .unwrap();

    let err = bed
        .controller
        .setup_connection(&response.connection_id)
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::InvalidRequest(_)));
}

#[tokio::test]
async fn health_reflects_store_agents_and_connections() {
    let bed = testbed().await;

    let _response = bed
        .controller
        .create_connection(request_a_to_b())
        .await
        .unwrap();
    publish_heartbeat(&bed.broker, &bed.config.monitoring_topic, "A-a-r1", "A").await;
    wait_for(Duration::from_secs(5), async || {
        bed.controller.registry().status_summary().total_agents == 1
    })
    .await;

    let health = bed.controller.health().await;
    assert!(health.healthy);
    assert!(health.store_healthy);
    assert_eq!(health.connections, 1);
    assert_eq!(health.agents.online_agents, 1);
    assert_eq!(health.qot.total_monitored, 0);

    let stats = bed.controller.manager().connection_stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(
        stats.by_status.get(ConnectionStatus::SetupInProgress.as_str()),
        Some(&1)
    );
}

/// Shutdown stops the consumer and the periodic tasks; the store stays
/// usable for whoever owns it.
#[tokio::test]
async fn shutdown_is_clean_and_bounded() {
    let bed = testbed().await;

    bed.controller.shutdown().await;

    // Records published after shutdown are no longer consumed.
    publish_heartbeat(&bed.broker, &bed.config.monitoring_topic, "C-c-r1", "C").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bed.controller.registry().status_summary().total_agents, 0);

    // The store outlives the controller.
    assert!(bed.store.health_check().await);
}

//! Bus-level integration: per-agent command ordering, heartbeat-fed
//! agent discovery, and ack routing through the consumer.

mod common;

use std::time::Duration;

use common::{drain_commands, publish_heartbeat, testbed, wait_for};
use lightpathd::bus::{InterfaceAction, Record};
use lightpathd::{BusTransport as _, InterfaceName, PopId, RouterId};

/// Property 8: two commands for the same agent are observed in the
/// order they were produced.
#[tokio::test]
async fn per_agent_command_ordering_is_preserved() {
    let bed = testbed().await;
    drain_commands(&bed.broker, &bed.config.config_topic).await;

    let pop = PopId::new("A".to_string());
    let router = RouterId::new("a-r1".to_string());
    let iface = InterfaceName::new("Ethernet0".to_string());

    bed.controller
        .dispatcher()
        .dispatch_interface_command(InterfaceAction::Down, &pop, &router, &iface)
        .await
        .unwrap();
    bed.controller
        .dispatcher()
        .dispatch_interface_command(InterfaceAction::Up, &pop, &router, &iface)
        .await
        .unwrap();

    let records = drain_commands(&bed.broker, &bed.config.config_topic).await;
    let actions: Vec<&str> = records
        .iter()
        .filter(|r| r.value["type"] == "interfaceControl")
        .map(|r| r.value["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["down", "up"]);

    for record in records {
        if record.value["type"] == "interfaceControl" {
            assert_eq!(record.key.as_deref(), Some("A-a-r1"));
        }
    }
}

/// Heartbeats on the monitoring topic populate the registry, and
/// addressing prefers the live registration.
#[tokio::test]
async fn heartbeats_feed_the_registry() {
    let bed = testbed().await;

    publish_heartbeat(&bed.broker, &bed.config.monitoring_topic, "A-a-r1", "A").await;

    wait_for(Duration::from_secs(5), async || {
        bed.controller
            .registry()
            .get(
                &PopId::new("A".to_string()),
                &RouterId::new("a-r1".to_string()),
            )
            .is_some()
    })
    .await;

    let agent = bed
        .controller
        .registry()
        .get(
            &PopId::new("A".to_string()),
            &RouterId::new("a-r1".to_string()),
        )
        .unwrap();
    assert!(agent.capabilities.contains(&"cmis".to_string()));

    let summary = bed.controller.registry().status_summary();
    assert_eq!(summary.total_agents, 1);
    assert_eq!(summary.online_agents, 1);
}

/// Discovery goes out at startup with no partition key.
#[tokio::test]
async fn startup_broadcasts_discovery() {
    let bed = testbed().await;
    let records = drain_commands(&bed.broker, &bed.config.config_topic).await;
    let discovery: Vec<&Record> = records
        .iter()
        .filter(|r| r.value["type"] == "discovery")
        .collect();
    assert_eq!(discovery.len(), 1);
    assert!(discovery[0].key.is_none());
    assert_eq!(
        discovery[0].value["parameters"]["controller_id"],
        "controller-vOp1"
    );
}

/// Acks and unknown record types flow through the consumer without
/// disturbing it; malformed records are counted.
#[tokio::test]
async fn consumer_survives_acks_noise_and_garbage() {
    let bed = testbed().await;

    for value in [
        serde_json::json!({
            "type": "commandAck",
            "agent_id": "A-a-r1",
            "command_id": "cmd-1",
            "status": "ok",
        }),
        serde_json::json!({"type": "somethingElse", "agent_id": "A-a-r1"}),
        serde_json::json!({"definitely": "not a monitoring record"}),
    ] {
        bed.broker
            .send(Record {
                topic: bed.config.monitoring_topic.clone(),
                key: None,
                value,
            })
            .await
            .unwrap();
    }

    wait_for(Duration::from_secs(5), async || {
        bed.controller.bus().malformed_records() == 1
    })
    .await;

    // The consumer is still alive and routing.
    publish_heartbeat(&bed.broker, &bed.config.monitoring_topic, "B-b-r1", "B").await;
    wait_for(Duration::from_secs(5), async || {
        bed.controller
            .registry()
            .get(
                &PopId::new("B".to_string()),
                &RouterId::new("b-r1".to_string()),
            )
            .is_some()
    })
    .await;

    let health = bed.controller.health().await;
    assert!(health.store_healthy);
    assert_eq!(health.malformed_records, 1);
}

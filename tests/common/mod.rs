//! Shared fixtures for integration tests: a seeded topology, a wired
//! controller over the in-process broker, and an agent simulator that
//! speaks the monitoring wire format.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lightpathd::bus::Record;
use lightpathd::{
    Controller, ControllerConfig, InProcessBroker, InterfaceName, LinkId, NetworkLink, PopId,
    PopNode, RouterId, SqliteResourceStore,
};

pub use lightpathd::ConnectionRequest;

/// POPs A, B, C in a line: A -(link-ab, 100 km)- B -(link-bc, 100 km)- C.
/// Each POP has one router with two interfaces.
pub async fn seeded_store(url: &str) -> Arc<SqliteResourceStore> {
    let store = Arc::new(
        SqliteResourceStore::connect(url, Duration::from_secs(5))
            .await
            .expect("store connect"),
    );

    let pops = vec![pop("A"), pop("B"), pop("C")];
    let links = vec![link("link-ab", "A", "B", 100.0), link("link-bc", "B", "C", 100.0)];
    let interfaces = all_interfaces(&["A", "B", "C"]);

    store
        .seed_topology(&pops, &links, &interfaces)
        .await
        .expect("seed topology");
    store
}

pub fn pop(id: &str) -> PopNode {
    PopNode {
        id: PopId::new(id.to_string()),
        name: format!("POP {id}"),
        location: None,
        routers: vec![RouterId::new(format!("{}-r1", id.to_lowercase()))],
        interfaces: vec![
            InterfaceName::new("Ethernet0".to_string()),
            InterfaceName::new("Ethernet4".to_string()),
        ],
    }
}

pub fn link(id: &str, a: &str, b: &str, km: f64) -> NetworkLink {
    NetworkLink {
        id: LinkId::new(id.to_string()),
        pop_a: PopId::new(a.to_string()),
        pop_b: PopId::new(b.to_string()),
        length_km: km,
        total_slots: 320,
    }
}

pub fn all_interfaces(pops: &[&str]) -> Vec<(PopId, RouterId, InterfaceName)> {
    let mut out = Vec::new();
    for id in pops {
        for iface in ["Ethernet0", "Ethernet4"] {
            out.push((
                PopId::new((*id).to_string()),
                RouterId::new(format!("{}-r1", id.to_lowercase())),
                InterfaceName::new(iface.to_string()),
            ));
        }
    }
    out
}

pub struct TestBed {
    pub store: Arc<SqliteResourceStore>,
    pub broker: Arc<InProcessBroker>,
    pub controller: Arc<Controller>,
    pub config: ControllerConfig,
}

/// A full controller over a freshly seeded in-memory store.
pub async fn testbed() -> TestBed {
    let config = ControllerConfig::testing();
    let store = seeded_store(&config.store_url).await;
    let broker = Arc::new(InProcessBroker::new());
    let controller = Controller::start(config.clone(), store.clone(), broker.clone())
        .await
        .expect("controller start");
    TestBed {
        store,
        broker,
        controller,
        config,
    }
}

/// A basic A→B request for 400G over DP-16QAM with pinned interfaces.
pub fn request_a_to_b() -> ConnectionRequest {
    ConnectionRequest {
        connection_id: None,
        source_pop: PopId::new("A".to_string()),
        destination_pop: PopId::new("B".to_string()),
        source_interface: Some(InterfaceName::new("Ethernet0".to_string())),
        destination_interface: Some(InterfaceName::new("Ethernet0".to_string())),
        bandwidth_gbps: 400.0,
        modulation: lightpathd::Modulation::Dp16Qam,
        metadata: serde_json::Map::new(),
    }
}

/// Publishes a telemetry record on the monitoring topic, as an agent
/// would.
pub async fn publish_telemetry(
    broker: &InProcessBroker,
    topic: &str,
    agent: &str,
    conn: &str,
    osnr: f64,
) {
    use lightpathd::BusTransport as _;
    broker
        .send(Record {
            topic: topic.to_string(),
            key: Some(agent.to_string()),
            value: serde_json::json!({
                "type": "telemetry",
                "agent_id": agent,
                "connection_id": conn,
                "timestamp": 0.0,
                "osnr": osnr,
            }),
        })
        .await
        .expect("publish telemetry");
}

/// Publishes a heartbeat on the monitoring topic.
pub async fn publish_heartbeat(broker: &InProcessBroker, topic: &str, agent: &str, pop: &str) {
    use lightpathd::BusTransport as _;
    let router = format!("{}-r1", pop.to_lowercase());
    broker
        .send(Record {
            topic: topic.to_string(),
            key: Some(agent.to_string()),
            value: serde_json::json!({
                "type": "agentHealth",
                "agent_id": agent,
                "status": "healthy",
                "payload": {
                    "pop_id": pop,
                    "router_id": router,
                    "capabilities": ["cmis", "telemetry"],
                },
            }),
        })
        .await
        .expect("publish heartbeat");
}

/// Drains the config topic, returning every queued command.
pub async fn drain_commands(broker: &InProcessBroker, topic: &str) -> Vec<Record> {
    use lightpathd::BusTransport as _;
    broker
        .poll(topic, 1000, Duration::from_millis(10))
        .await
        .expect("poll config topic")
}

/// Waits until `predicate` holds or the deadline passes.
pub async fn wait_for<F>(deadline: Duration, mut predicate: F)
where
    F: AsyncFnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if predicate().await {
            return;
        }
        assert!(
            start.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

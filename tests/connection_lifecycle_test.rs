//! End-to-end connection lifecycle scenarios: create/activate,
//! first-fit behavior, spectrum exhaustion, path continuity, teardown,
//! and restart persistence.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{request_a_to_b, testbed};
use lightpathd::{
    ConnectionId, ConnectionManager, ConnectionRequest, ConnectionStatus, ControllerError,
    InterfaceName, LinkId, Modulation, PathComputer, PopId, ResourceStore, RouterId,
};

fn link_ab() -> LinkId {
    LinkId::new("link-ab".to_string())
}

/// S1: one 100 km link, 320 free slots, 400G over DP-16QAM. First fit
/// takes the lowest run; completion activates the connection.
#[tokio::test]
async fn create_and_activate() {
    let bed = testbed().await;

    let response = bed
        .controller
        .create_connection(request_a_to_b())
        .await
        .unwrap();
    assert_eq!(response.status, ConnectionStatus::SetupInProgress);
    // 400G at 4 bit/s/Hz = 100 GHz = 8 slots, indices 0..8 by first fit.
    let slots: Vec<u16> = (0..8).collect();
    assert_eq!(response.path.len(), 1);
    assert_eq!(response.path[0].allocated_slots, slots);
    assert_eq!(response.estimated_osnr, Some(25.0));

    let free: HashSet<u16> = bed
        .store
        .get_available_slots(&link_ab())
        .await
        .unwrap()
        .into_iter()
        .collect();
    assert!(!free.contains(&0));
    assert!(free.contains(&8));
    assert_eq!(free.len(), 312);

    bed.controller
        .complete_setup(&response.connection_id)
        .await
        .unwrap();
    let conn = bed
        .controller
        .manager()
        .get_connection(&response.connection_id)
        .await
        .unwrap();
    assert_eq!(conn.status, ConnectionStatus::Active);
}

/// S2: a hole at the bottom of the spectrum moves first fit up.
#[tokio::test]
async fn first_fit_skips_occupied_bottom() {
    let bed = testbed().await;

    let blocker = ConnectionId::new("conn-blocker".to_string());
    assert!(bed
        .store
        .allocate_spectrum_slots(&link_ab(), &blocker, &[0])
        .await
        .unwrap());

    let mut request = request_a_to_b();
    request.bandwidth_gbps = 100.0; // 2 slots at DP-16QAM
    let response = bed.controller.create_connection(request).await.unwrap();
    assert_eq!(response.path[0].allocated_slots, vec![1, 2]);
}

/// S3: not enough contiguous spectrum leaves no residue behind.
#[tokio::test]
async fn no_spectrum_leaves_no_residual_state() {
    let bed = testbed().await;

    // Leave exactly one slot free.
    let blocker = ConnectionId::new("conn-blocker".to_string());
    let bulk: Vec<u16> = (0..319).collect();
    assert!(bed
        .store
        .allocate_spectrum_slots(&link_ab(), &blocker, &bulk)
        .await
        .unwrap());

    let mut request = request_a_to_b();
    request.bandwidth_gbps = 100.0; // needs 2 slots
    let err = bed.controller.create_connection(request).await.unwrap_err();
    assert!(matches!(err, ControllerError::NoSpectrum(_)));

    // Free set unchanged, no record, no in-memory entry, interfaces free.
    assert_eq!(
        bed.store.get_available_slots(&link_ab()).await.unwrap(),
        vec![319]
    );
    assert!(bed.store.load_connections().await.unwrap().is_empty());
    assert!(bed.controller.manager().is_empty());
    let available = bed
        .store
        .available_interfaces(&PopId::new("A".to_string()), &RouterId::new("a-r1".to_string()))
        .await
        .unwrap();
    assert_eq!(available.len(), 2);
}

/// S4: continuity across segments; a slot occupied on one link only
/// must not shift the chosen run when a lower one is free everywhere.
#[tokio::test]
async fn path_continuity_uses_common_lowest_slot() {
    let bed = testbed().await;

    let blocker = ConnectionId::new("conn-blocker".to_string());
    assert!(bed
        .store
        .allocate_spectrum_slots(&link_ab(), &blocker, &[5])
        .await
        .unwrap());

    let request = ConnectionRequest {
        connection_id: None,
        source_pop: PopId::new("A".to_string()),
        destination_pop: PopId::new("C".to_string()),
        source_interface: None,
        destination_interface: None,
        bandwidth_gbps: 50.0, // 1 slot at DP-16QAM
        modulation: Modulation::Dp16Qam,
        metadata: serde_json::Map::new(),
    };
    let response = bed.controller.create_connection(request).await.unwrap();

    assert_eq!(response.path.len(), 2);
    for segment in &response.path {
        assert_eq!(segment.allocated_slots, vec![0]);
    }
}

/// S7: teardown returns every resource and erases every trace.
#[tokio::test]
async fn teardown_releases_everything() {
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

    bed.controller
        .teardown_connection(&response.connection_id)
        .await
        .unwrap();

    assert!(bed.store.load_connections().await.unwrap().is_empty());
    assert!(bed.controller.manager().is_empty());
    assert_eq!(
        bed.store.get_available_slots(&link_ab()).await.unwrap().len(),
        320
    );
    for pop in ["A", "B"] {
        let available = bed
            .store
            .available_interfaces(
                &PopId::new(pop.to_string()),
                &RouterId::new(format!("{}-r1", pop.to_lowercase())),
            )
            .await
            .unwrap();
        assert_eq!(available.len(), 2, "interfaces of {pop} not released");
    }
}

/// Property 5: a second teardown succeeds and changes nothing.
#[tokio::test]
async fn teardown_is_idempotent() {
    let bed = testbed().await;

    let response = bed
        .controller
        .create_connection(request_a_to_b())
        .await
        .unwrap();
    bed.controller
        .teardown_connection(&response.connection_id)
        .await
        .unwrap();
    bed.controller
        .teardown_connection(&response.connection_id)
        .await
        .unwrap();

    assert!(bed.controller.manager().is_empty());
    assert_eq!(
        bed.store.get_available_slots(&link_ab()).await.unwrap().len(),
        320
    );
}

#[tokio::test]
async fn same_source_and_destination_is_invalid() {
    let bed = testbed().await;
    let mut request = request_a_to_b();
    request.destination_pop = PopId::new("A".to_string());
    let err = bed.controller.create_connection(request).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidRequest(_)));
}

#[tokio::test]
async fn unknown_pop_is_invalid() {
    let bed = testbed().await;
    let mut request = request_a_to_b();
    request.destination_pop = PopId::new("Z".to_string());
    let err = bed.controller.create_connection(request).await.unwrap_err();
    assert!(matches!(err, ControllerError::InvalidRequest(_)));
}

#[tokio::test]
async fn taken_interface_is_resource_unavailable() {
    let bed = testbed().await;

    let squatter = ConnectionId::new("conn-squatter".to_string());
    assert!(bed
        .store
        .allocate_interface(
            &PopId::new("A".to_string()),
            &RouterId::new("a-r1".to_string()),
            &InterfaceName::new("Ethernet0".to_string()),
            &squatter,
        )
        .await
        .unwrap());

    let err = bed
        .controller
        .create_connection(request_a_to_b())
        .await
        .unwrap_err();
    assert!(matches!(err, ControllerError::ResourceUnavailable(_)));
    assert!(bed.controller.manager().is_empty());
}

#[tokio::test]
async fn setup_events_are_fsm_checked() {
    let bed = testbed().await;
    let response = bed
        .controller
        .create_connection(request_a_to_b())
        .await
        .unwrap();
    let id = response.connection_id;

    bed.controller.complete_setup(&id).await.unwrap();
    // Completing twice is an illegal ACTIVE transition.
    let err = bed.controller.complete_setup(&id).await.unwrap_err();
    assert!(matches!(err, ControllerError::FsmReject { .. }));
}

/// Property 6: create → restart → list yields the same non-terminal
/// connections with identical status.
#[tokio::test]
async fn connections_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!(
        "sqlite://{}",
        dir.path().join("controller.db").to_str().unwrap()
    );

    let store = common::seeded_store(&url).await;
    let config = lightpathd::ControllerConfig::testing();
    let paths = Arc::new(
        PathComputer::new(store.clone() as Arc<dyn ResourceStore>, &config)
            .await
            .unwrap(),
    );
    let manager = ConnectionManager::new(store.clone() as Arc<dyn ResourceStore>, paths);

    let response = manager.create_connection(request_a_to_b()).await.unwrap();
    manager.complete_setup(&response.connection_id).await.unwrap();
    store.close().await;

    // New process: fresh store handle, fresh manager, same database.
    let store = Arc::new(
        lightpathd::SqliteResourceStore::connect(&url, std::time::Duration::from_secs(5))
            .await
            .unwrap(),
    );
    let config = lightpathd::ControllerConfig::testing();
    let paths = Arc::new(
        PathComputer::new(store.clone() as Arc<dyn ResourceStore>, &config)
            .await
            .unwrap(),
    );
    let manager = ConnectionManager::new(store as Arc<dyn ResourceStore>, paths);
    let loaded = manager.reload().await.unwrap();
    assert_eq!(loaded, 1);

    let survivors = manager.list_connections(None).await;
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].id, response.connection_id);
    assert_eq!(survivors[0].status, ConnectionStatus::Active);
    assert_eq!(survivors[0].path, response.path);
}

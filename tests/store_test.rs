//! Resource store semantics: atomic slot allocation, conservation,
//! idempotent release, interface compare-and-set, and read-through
//! defaults.

mod common;

use std::collections::HashSet;

use lightpathd::{
    ConnectionId, InterfaceName, LinkId, PopId, ResourceStore, RouterId, SqliteResourceStore,
};
use proptest::prelude::*;

fn link_ab() -> LinkId {
    LinkId::new("link-ab".to_string())
}

fn conn(n: usize) -> ConnectionId {
    ConnectionId::new(format!("conn-{n:04}"))
}

async fn free_set(store: &SqliteResourceStore, link: &LinkId) -> HashSet<u16> {
    store
        .get_available_slots(link)
        .await
        .unwrap()
        .into_iter()
        .collect()
}

#[tokio::test]
async fn allocation_is_all_or_nothing() {
    let store = common::seeded_store("sqlite::memory:").await;
    let link = link_ab();

    assert!(store
        .allocate_spectrum_slots(&link, &conn(1), &[3, 4])
        .await
        .unwrap());

    // Overlapping request fails entirely; nothing from it is taken.
    assert!(!store
        .allocate_spectrum_slots(&link, &conn(2), &[4, 5])
        .await
        .unwrap());

    let free = free_set(&store, &link).await;
    assert!(!free.contains(&3));
    assert!(!free.contains(&4));
    assert!(free.contains(&5));
    assert_eq!(free.len(), 318);
}

#[tokio::test]
async fn release_is_idempotent() {
    let store = common::seeded_store("sqlite::memory:").await;
    let link = link_ab();

    assert!(store
        .allocate_spectrum_slots(&link, &conn(1), &[0, 1])
        .await
        .unwrap());
    assert!(store.release_spectrum_slots(&link, &conn(1)).await.unwrap());
    assert!(store.release_spectrum_slots(&link, &conn(1)).await.unwrap());

    assert_eq!(free_set(&store, &link).await.len(), 320);
}

#[tokio::test]
async fn unknown_link_allocation_fails_cleanly() {
    let store = common::seeded_store("sqlite::memory:").await;
    let ghost = LinkId::new("link-zz".to_string());
    assert!(!store
        .allocate_spectrum_slots(&ghost, &conn(1), &[0])
        .await
        .unwrap());
}

#[tokio::test]
async fn interface_allocation_is_compare_and_set() {
    let store = common::seeded_store("sqlite::memory:").await;
    let pop = PopId::new("A".to_string());
    let router = RouterId::new("a-r1".to_string());
    let iface = InterfaceName::new("Ethernet0".to_string());

    assert!(store
        .allocate_interface(&pop, &router, &iface, &conn(1))
        .await
        .unwrap());
    // Second taker loses.
    assert!(!store
        .allocate_interface(&pop, &router, &iface, &conn(2))
        .await
        .unwrap());

    let available = store.available_interfaces(&pop, &router).await.unwrap();
    assert_eq!(available, vec![InterfaceName::new("Ethernet4".to_string())]);

    assert!(store.release_interface(&pop, &router, &iface).await.unwrap());
    assert!(store
        .allocate_interface(&pop, &router, &iface, &conn(2))
        .await
        .unwrap());
}

#[tokio::test]
async fn exact_fill_leaves_nothing_free() {
    let store = common::seeded_store("sqlite::memory:").await;
    let link = link_ab();
    let all: Vec<u16> = (0..320).collect();

    assert!(store
        .allocate_spectrum_slots(&link, &conn(1), &all)
        .await
        .unwrap());
    assert!(free_set(&store, &link).await.is_empty());

    // A full link must not be mistaken for an unseeded one.
    assert!(!store
        .allocate_spectrum_slots(&link, &conn(2), &[0])
        .await
        .unwrap());

    assert!(store.release_spectrum_slots(&link, &conn(1)).await.unwrap());
    assert_eq!(free_set(&store, &link).await.len(), 320);
}

#[tokio::test]
async fn health_check_answers() {
    let store = common::seeded_store("sqlite::memory:").await;
    assert!(store.health_check().await);
}

/// Slot conservation: after any interleaving of allocates and releases
/// the free set and the per-connection occupancy partition the full
/// range with no overlap.
#[test]
fn slot_conservation_under_random_workloads() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    proptest!(ProptestConfig::with_cases(32), |(
        ops in proptest::collection::vec((0usize..8, 0u16..40, 1u16..6, any::<bool>()), 1..24)
    )| {
        runtime.block_on(async {
            let store = common::seeded_store("sqlite::memory:").await;
            let link = link_ab();
            let mut held: Vec<(ConnectionId, Vec<u16>)> = Vec::new();

            for (who, start, len, release) in ops {
                let id = conn(who);
                if release {
                    store.release_spectrum_slots(&link, &id).await.unwrap();
                    held.retain(|(h, _)| *h != id);
                } else if !held.iter().any(|(h, _)| *h == id) {
                    let slots: Vec<u16> = (start..start + len).collect();
                    if store
                        .allocate_spectrum_slots(&link, &id, &slots)
                        .await
                        .unwrap()
                    {
                        held.push((id, slots));
                    }
                }

                // Quiescent point: free ∪ Σ held == {0..319}, disjoint.
                let free = free_set(&store, &link).await;
                let mut occupied = HashSet::new();
                for (_, slots) in &held {
                    for slot in slots {
                        prop_assert!(
                            occupied.insert(*slot),
                            "slot {slot} held by two connections"
                        );
                    }
                }
                prop_assert!(free.is_disjoint(&occupied));
                prop_assert_eq!(free.len() + occupied.len(), 320);
            }
            Ok(())
        })?;
    });
}

//! Resource store abstraction.
//!
//! Persistent topology, interface, spectrum-slot, and connection state
//! behind a narrow async trait. The store is the source of truth:
//! in-memory caches elsewhere in the controller are advisory and are
//! rebuilt from it on restart. Store unavailability surfaces as a
//! [`StoreError`] to the caller, which owns any compensation.

mod sqlite;

pub use sqlite::SqliteResourceStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    ConnectionId, ConnectionStatus, InterfaceName, LinkId, Modulation, NetworkLink, PathSegment,
    PopId, PopNode, RouterId,
};

/// Errors surfaced by store operations, unchanged, to the caller.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

/// Persisted shape of a connection, as written at create time and read
/// back on restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub status: ConnectionStatus,
    pub source_pop: PopId,
    pub destination_pop: PopId,
    pub source_interface: Option<InterfaceName>,
    pub destination_interface: Option<InterfaceName>,
    pub source_router: Option<RouterId>,
    pub destination_router: Option<RouterId>,
    pub bandwidth_gbps: f64,
    pub modulation: Modulation,
    pub estimated_osnr: Option<f64>,
    pub path: Vec<PathSegment>,
    pub details: serde_json::Map<String, serde_json::Value>,
    pub created_at: f64,
    pub updated_at: f64,
}

/// Narrow persistence interface required by the controller core.
///
/// Multi-step mutations (interface compare-and-set, slot allocation)
/// are atomic: they either apply completely or leave the store
/// untouched and report `false`.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Loads the full topology. Links whose free-slot set was never
    /// seeded read as entirely free.
    async fn load_topology(
        &self,
    ) -> Result<(HashMap<PopId, PopNode>, HashMap<LinkId, NetworkLink>), StoreError>;

    /// Names of interfaces currently AVAILABLE on (pop, router).
    async fn available_interfaces(
        &self,
        pop: &PopId,
        router: &RouterId,
    ) -> Result<Vec<InterfaceName>, StoreError>;

    /// Atomically moves an interface AVAILABLE → OCCUPIED for the given
    /// connection. Returns `false` when the interface is missing or
    /// already held.
    async fn allocate_interface(
        &self,
        pop: &PopId,
        router: &RouterId,
        name: &InterfaceName,
        conn: &ConnectionId,
    ) -> Result<bool, StoreError>;

    /// Returns an interface to AVAILABLE and clears its owner. `false`
    /// when the interface does not exist.
    async fn release_interface(
        &self,
        pop: &PopId,
        router: &RouterId,
        name: &InterfaceName,
    ) -> Result<bool, StoreError>;

    /// Atomically claims the given slots on a link for a connection.
    /// Fails the whole operation (returning `false`) when any slot is
    /// not currently free; no partial allocation survives.
    async fn allocate_spectrum_slots(
        &self,
        link: &LinkId,
        conn: &ConnectionId,
        slots: &[u16],
    ) -> Result<bool, StoreError>;

    /// Returns every slot the connection holds on the link to the free
    /// set. Idempotent: releasing a connection with no slots succeeds.
    async fn release_spectrum_slots(
        &self,
        link: &LinkId,
        conn: &ConnectionId,
    ) -> Result<bool, StoreError>;

    /// Sorted free slot indices of a link (full range when unseeded).
    async fn get_available_slots(&self, link: &LinkId) -> Result<Vec<u16>, StoreError>;

    /// Persists a fresh connection record.
    async fn create_connection_record(&self, record: &ConnectionRecord) -> Result<(), StoreError>;

    /// Updates status (and merges optional detail fields) of a record.
    /// Returns `false` when the record does not exist.
    async fn update_connection_status(
        &self,
        conn: &ConnectionId,
        status: ConnectionStatus,
        details: Option<serde_json::Value>,
    ) -> Result<bool, StoreError>;

    /// Removes a connection record. Deleting an absent record succeeds.
    async fn delete_connection_record(&self, conn: &ConnectionId) -> Result<bool, StoreError>;

    /// All persisted connection records.
    async fn load_connections(&self) -> Result<Vec<ConnectionRecord>, StoreError>;

    /// True when the store answers a round trip.
    async fn health_check(&self) -> bool;
}

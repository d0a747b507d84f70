//! Connection lifecycle management.
//!
//! Owns the connection state machine and sequences the multi-resource
//! transaction that materializes a connection: path computation,
//! interface and spectrum allocation in the store, and full rollback
//! when any step fails. Per-connection transitions are serialized by a
//! per-connection mutex; the create transaction is additionally
//! serialized controller-wide.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    unix_now, Connection, ConnectionEvent, ConnectionId, ConnectionStatus, InterfaceName, LinkId,
    Modulation, PathSegment, PopId, QotSample, RouterId,
};
use crate::error::{ControllerError, Result};
use crate::path::PathComputer;
use crate::store::{ConnectionRecord, ResourceStore};

/// Provisioning request for a new end-to-end connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    /// Caller-supplied id; generated when absent.
    pub connection_id: Option<ConnectionId>,
    pub source_pop: PopId,
    pub destination_pop: PopId,
    pub source_interface: Option<InterfaceName>,
    pub destination_interface: Option<InterfaceName>,
    pub bandwidth_gbps: f64,
    pub modulation: Modulation,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Connection state as reported to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub connection_id: ConnectionId,
    pub status: ConnectionStatus,
    pub source_pop: PopId,
    pub destination_pop: PopId,
    pub source_interface: Option<InterfaceName>,
    pub destination_interface: Option<InterfaceName>,
    pub path: Vec<PathSegment>,
    pub bandwidth_gbps: f64,
    pub modulation: Modulation,
    pub setup_time: f64,
    pub estimated_osnr: Option<f64>,
    pub message: String,
}

impl ConnectionResponse {
    fn from_connection(conn: &Connection, message: impl Into<String>) -> Self {
        Self {
            connection_id: conn.id.clone(),
            status: conn.status,
            source_pop: conn.source_pop.clone(),
            destination_pop: conn.destination_pop.clone(),
            source_interface: conn.source_interface.clone(),
            destination_interface: conn.destination_interface.clone(),
            path: conn.path.clone(),
            bandwidth_gbps: conn.bandwidth_gbps,
            modulation: conn.modulation,
            setup_time: conn.setup_time,
            estimated_osnr: conn.estimated_osnr,
            message: message.into(),
        }
    }
}

/// Aggregate connection statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub by_status: HashMap<String, usize>,
    pub bandwidth_total_gbps: f64,
    pub reconfig_count_total: u32,
}

/// Connection manager: FSM plus resource orchestration.
pub struct ConnectionManager {
    store: Arc<dyn ResourceStore>,
    paths: Arc<PathComputer>,
    connections: DashMap<ConnectionId, Arc<Mutex<Connection>>>,
    /// Serializes the multi-resource create transaction.
    create_gate: Mutex<()>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(store: Arc<dyn ResourceStore>, paths: Arc<PathComputer>) -> Self {
        Self {
            store,
            paths,
            connections: DashMap::new(),
            create_gate: Mutex::new(()),
        }
    }

    /// Rebuilds the in-memory index from the store: every non-terminal
    /// record becomes a live connection again.
    #[instrument(skip(self))]
    pub async fn reload(&self) -> Result<usize> {
        let records = self.store.load_connections().await?;
        let mut loaded = 0;
        for record in records {
            if record.status.is_terminal() {
                continue;
            }
            // Older records may predate the router columns; fall back
            // to the POP's first router so dispatch stays addressable.
            let source_router = record.source_router.clone().or_else(|| {
                self.paths
                    .pop(&record.source_pop)
                    .and_then(|n| n.routers.first().cloned())
            });
            let destination_router = record.destination_router.clone().or_else(|| {
                self.paths
                    .pop(&record.destination_pop)
                    .and_then(|n| n.routers.first().cloned())
            });
            let conn = Connection {
                id: record.id.clone(),
                source_pop: record.source_pop,
                destination_pop: record.destination_pop,
                source_interface: record.source_interface,
                destination_interface: record.destination_interface,
                source_router,
                destination_router,
                path: record.path,
                bandwidth_gbps: record.bandwidth_gbps,
                modulation: record.modulation,
                status: record.status,
                setup_time: record.created_at,
                estimated_osnr: record.estimated_osnr,
                qot_history: std::collections::VecDeque::new(),
                last_reconfig_time: None,
                reconfig_count: 0,
                metadata: record.details,
            };
            info!(conn = %conn.id, status = conn.status.as_str(), "loaded existing connection");
            self.connections
                .insert(record.id, Arc::new(Mutex::new(conn)));
            loaded += 1;
        }
        info!(loaded, "reloaded connections from store");
        Ok(loaded)
    }

    /// Creates a connection: validates, plans, persists a PENDING
    /// record, allocates every resource, and moves the machine to
    /// SETUP_IN_PROGRESS. On any allocation failure all prior
    /// allocations and the record are undone before the error returns.
    #[instrument(skip(self, request), fields(source = %request.source_pop, destination = %request.destination_pop))]
    pub async fn create_connection(&self, request: ConnectionRequest) -> Result<ConnectionResponse> {
        let _gate = self.create_gate.lock().await;

        if request.source_pop == request.destination_pop {
            return Err(ControllerError::InvalidRequest(
                "source and destination POP must differ".to_string(),
            ));
        }
        self.paths
            .validate_endpoints(
                &request.source_pop,
                &request.destination_pop,
                request.source_interface.as_ref(),
                request.destination_interface.as_ref(),
            )
            .await?;

        let conn_id = request
            .connection_id
            .clone()
            .unwrap_or_else(ConnectionId::generate);
        if self.connections.contains_key(&conn_id) {
            return Err(ControllerError::InvalidRequest(format!(
                "connection {conn_id} already exists"
            )));
        }

        let plan = self
            .paths
            .compute(
                &request.source_pop,
                &request.destination_pop,
                request.bandwidth_gbps,
                request.modulation,
            )
            .await?;

        let now = unix_now();
        let mut conn = Connection {
            id: conn_id.clone(),
            source_pop: request.source_pop.clone(),
            destination_pop: request.destination_pop.clone(),
            source_interface: request.source_interface.clone(),
            destination_interface: request.destination_interface.clone(),
            source_router: None,
            destination_router: None,
            path: plan.segments.clone(),
            bandwidth_gbps: request.bandwidth_gbps,
            modulation: request.modulation,
            status: ConnectionStatus::Pending,
            setup_time: now,
            estimated_osnr: plan.estimated_osnr,
            qot_history: std::collections::VecDeque::new(),
            last_reconfig_time: None,
            reconfig_count: 0,
            metadata: request.metadata.clone(),
        };

        let record = ConnectionRecord {
            id: conn_id.clone(),
            status: ConnectionStatus::Pending,
            source_pop: conn.source_pop.clone(),
            destination_pop: conn.destination_pop.clone(),
            source_interface: conn.source_interface.clone(),
            destination_interface: conn.destination_interface.clone(),
            source_router: None,
            destination_router: None,
            bandwidth_gbps: conn.bandwidth_gbps,
            modulation: conn.modulation,
            estimated_osnr: conn.estimated_osnr,
            path: conn.path.clone(),
            details: conn.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_connection_record(&record).await?;

        // Resource allocation with full compensation on failure.
        let mut held_interfaces: Vec<(PopId, RouterId, InterfaceName)> = Vec::new();
        let mut held_links: Vec<LinkId> = Vec::new();

        if let Err(e) = self
            .allocate_resources(&mut conn, &plan.segments, &mut held_interfaces, &mut held_links)
            .await
        {
            self.rollback_create(&conn_id, &held_interfaces, &held_links)
                .await;
            return Err(e);
        }

        conn.status = ConnectionStatus::Pending
            .apply(ConnectionEvent::SetupRequested)
            .unwrap_or(ConnectionStatus::SetupInProgress);
        // Rewrite the record so the new status and the routers chosen
        // during allocation survive a restart.
        let record = ConnectionRecord {
            status: conn.status,
            source_router: conn.source_router.clone(),
            destination_router: conn.destination_router.clone(),
            updated_at: unix_now(),
            ..record
        };
        if let Err(e) = self.store.create_connection_record(&record).await {
            self.rollback_create(&conn_id, &held_interfaces, &held_links)
                .await;
            return Err(e.into());
        }

        let response = ConnectionResponse::from_connection(
            &conn,
            "Connection created successfully. Ready for agent setup.",
        );
        info!(
            conn = %conn_id,
            slots = plan.required_slots,
            "created connection {} -> {}",
            conn.source_pop,
            conn.destination_pop
        );
        self.connections
            .insert(conn_id, Arc::new(Mutex::new(conn)));
        Ok(response)
    }

    async fn allocate_resources(
        &self,
        conn: &mut Connection,
        segments: &[PathSegment],
        held_interfaces: &mut Vec<(PopId, RouterId, InterfaceName)>,
        held_links: &mut Vec<LinkId>,
    ) -> Result<()> {
        conn.source_router = self
            .allocate_endpoint(
                &conn.id,
                &conn.source_pop,
                conn.source_interface.as_ref(),
                held_interfaces,
            )
            .await?;
        conn.destination_router = self
            .allocate_endpoint(
                &conn.id,
                &conn.destination_pop,
                conn.destination_interface.as_ref(),
                held_interfaces,
            )
            .await?;

        for segment in segments {
            let ok = self
                .store
                .allocate_spectrum_slots(&segment.link_id, &conn.id, &segment.allocated_slots)
                .await?;
            if !ok {
                return Err(ControllerError::ResourceUnavailable(format!(
                    "slots {:?} no longer free on link {}",
                    segment.allocated_slots, segment.link_id
                )));
            }
            held_links.push(segment.link_id.clone());
        }
        Ok(())
    }

    /// Allocates the endpoint interface on the first router that takes
    /// it, and reports which router serves the endpoint. Without an
    /// interface request the POP's first router serves the endpoint.
    async fn allocate_endpoint(
        &self,
        conn: &ConnectionId,
        pop: &PopId,
        interface: Option<&InterfaceName>,
        held_interfaces: &mut Vec<(PopId, RouterId, InterfaceName)>,
    ) -> Result<Option<RouterId>> {
        let node = self
            .paths
            .pop(pop)
            .ok_or_else(|| ControllerError::InvalidRequest(format!("POP {pop} not found")))?;

        let Some(name) = interface else {
            return Ok(node.routers.first().cloned());
        };

        for router in &node.routers {
            if self
                .store
                .allocate_interface(pop, router, name, conn)
                .await?
            {
                held_interfaces.push((pop.clone(), router.clone(), name.clone()));
                return Ok(Some(router.clone()));
            }
        }
        Err(ControllerError::ResourceUnavailable(format!(
            "interface {name} not available on {pop}"
        )))
    }

    /// Undoes a partially-created connection: every held interface and
    /// slot goes back, and the record disappears. Release failures are
    /// logged; compensation is best-effort.
    async fn rollback_create(
        &self,
        conn: &ConnectionId,
        held_interfaces: &[(PopId, RouterId, InterfaceName)],
        held_links: &[LinkId],
    ) {
        warn!(conn = %conn, "rolling back partial create");
        for (pop, router, name) in held_interfaces {
            if let Err(e) = self.store.release_interface(pop, router, name).await {
                error!(conn = %conn, interface = %name, error = %e, "rollback: interface release failed");
            }
        }
        for link in held_links {
            if let Err(e) = self.store.release_spectrum_slots(link, conn).await {
                error!(conn = %conn, link = %link, error = %e, "rollback: slot release failed");
            }
        }
        if let Err(e) = self.store.delete_connection_record(conn).await {
            error!(conn = %conn, error = %e, "rollback: record delete failed");
        }
    }

    fn entry(&self, id: &ConnectionId) -> Result<Arc<Mutex<Connection>>> {
        self.connections
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ControllerError::NotFound(format!("connection {id}")))
    }

    /// Applies an FSM event under the per-connection mutex, then writes
    /// the new status through to the store.
    async fn apply_event(
        &self,
        id: &ConnectionId,
        event: ConnectionEvent,
        details: Option<serde_json::Value>,
    ) -> Result<ConnectionStatus> {
        let entry = self.entry(id)?;
        let next = {
            let mut conn = entry.lock().await;
            let next = conn
                .status
                .apply(event)
                .ok_or(ControllerError::FsmReject {
                    status: conn.status,
                    event,
                })?;
            info!(conn = %id, "{} -> {} ({event:?})", conn.status.as_str(), next.as_str());
            conn.status = next;
            next
        };
        self.store.update_connection_status(id, next, details).await?;
        Ok(next)
    }

    /// Marks setup complete; the connection becomes ACTIVE.
    pub async fn complete_setup(&self, id: &ConnectionId) -> Result<()> {
        self.apply_event(
            id,
            ConnectionEvent::SetupCompleted,
            Some(json!({"setup_completed_at": unix_now()})),
        )
        .await?;
        Ok(())
    }

    /// Marks setup failed; the connection becomes FAILED.
    pub async fn fail_setup(&self, id: &ConnectionId, reason: &str) -> Result<()> {
        self.apply_event(
            id,
            ConnectionEvent::SetupFailed,
            Some(json!({"setup_failed_at": unix_now(), "reason": reason})),
        )
        .await?;
        Ok(())
    }

    /// Records a degradation observation. Appends the sample to the
    /// connection's QoT history and transitions ACTIVE connections to
    /// DEGRADED. Returns whether the connection is degraded afterwards.
    pub async fn mark_degraded(
        &self,
        id: &ConnectionId,
        sample: Option<QotSample>,
    ) -> Result<bool> {
        let entry = self.entry(id)?;
        let (transitioned, details) = {
            let mut conn = entry.lock().await;
            if let Some(sample) = sample {
                conn.push_qot_sample(sample);
            }
            if conn.status == ConnectionStatus::Degraded {
                return Ok(true);
            }
            let Some(next) = conn.status.apply(ConnectionEvent::DegradationDetected) else {
                debug!(conn = %id, status = conn.status.as_str(), "degradation observed outside ACTIVE");
                return Ok(false);
            };
            info!(conn = %id, "{} -> {} (DEGRADATION_DETECTED)", conn.status.as_str(), next.as_str());
            conn.status = next;
            let latest = conn.qot_history.back();
            let details = json!({
                "degradation_detected_at": unix_now(),
                "degradation_metrics": {
                    "osnr": latest.and_then(|s| s.osnr),
                    "pre_fec_ber": latest.and_then(|s| s.pre_fec_ber),
                },
            });
            (next, details)
        };
        self.store
            .update_connection_status(id, transitioned, Some(details))
            .await?;
        Ok(true)
    }

    /// Starts a reconfiguration cycle, recording reason, count, and
    /// timestamp. Rejected by the FSM outside ACTIVE/DEGRADED.
    pub async fn start_reconfiguration(&self, id: &ConnectionId, reason: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let (next, count) = {
            let mut conn = entry.lock().await;
            let next = conn
                .status
                .apply(ConnectionEvent::ReconfigRequested)
                .ok_or(ControllerError::FsmReject {
                    status: conn.status,
                    event: ConnectionEvent::ReconfigRequested,
                })?;
            conn.status = next;
            conn.reconfig_count += 1;
            conn.last_reconfig_time = Some(unix_now());
            (next, conn.reconfig_count)
        };
        self.store
            .update_connection_status(
                id,
                next,
                Some(json!({
                    "reconfig_started_at": unix_now(),
                    "reconfig_reason": reason,
                    "reconfig_count": count,
                })),
            )
            .await?;
        info!(conn = %id, count, reason, "reconfiguration started");
        Ok(())
    }

    /// Returns a reconfigured connection to ACTIVE.
    pub async fn complete_reconfiguration(&self, id: &ConnectionId) -> Result<()> {
        self.apply_event(
            id,
            ConnectionEvent::ReconfigCompleted,
            Some(json!({"reconfig_completed_at": unix_now()})),
        )
        .await?;
        Ok(())
    }

    /// Drops a failed reconfiguration back to DEGRADED.
    pub async fn fail_reconfiguration(&self, id: &ConnectionId) -> Result<()> {
        self.apply_event(
            id,
            ConnectionEvent::ReconfigFailed,
            Some(json!({"reconfig_failed_at": unix_now()})),
        )
        .await?;
        Ok(())
    }

    /// Tears a connection down: releases every slot and interface it
    /// holds, deletes the record, and drops the in-memory entry.
    /// Idempotent and best-effort; individual release failures are
    /// logged but never block progress.
    #[instrument(skip(self), fields(conn = %id))]
    pub async fn teardown(&self, id: &ConnectionId) -> Result<()> {
        let Some(entry) = self.connections.get(id).map(|e| Arc::clone(e.value())) else {
            // Already gone from memory; make sure the record is too.
            self.store.delete_connection_record(id).await?;
            debug!("teardown of unknown connection is a no-op");
            return Ok(());
        };

        // The per-connection mutex is held across the whole teardown so
        // concurrent reconfig/teardown of the same connection serialize.
        let mut conn = entry.lock().await;

        if let Some(next) = conn.status.apply(ConnectionEvent::TeardownRequested) {
            conn.status = next;
            if let Err(e) = self
                .store
                .update_connection_status(id, next, Some(json!({"teardown_started_at": unix_now()})))
                .await
            {
                warn!(error = %e, "teardown: status update failed, continuing");
            }
        }

        for segment in &conn.path {
            if let Err(e) = self
                .store
                .release_spectrum_slots(&segment.link_id, id)
                .await
            {
                warn!(link = %segment.link_id, error = %e, "teardown: slot release failed, continuing");
            }
        }

        let endpoints = [
            (
                conn.source_pop.clone(),
                conn.source_router.clone(),
                conn.source_interface.clone(),
            ),
            (
                conn.destination_pop.clone(),
                conn.destination_router.clone(),
                conn.destination_interface.clone(),
            ),
        ];
        for (pop, router, interface) in endpoints {
            let Some(name) = interface else { continue };
            match router {
                Some(router) => {
                    if let Err(e) = self.store.release_interface(&pop, &router, &name).await {
                        warn!(interface = %name, error = %e, "teardown: interface release failed, continuing");
                    }
                }
                None => {
                    // Router unknown (e.g. record predates this field):
                    // try every router of the POP.
                    if let Some(node) = self.paths.pop(&pop) {
                        for router in &node.routers {
                            match self.store.release_interface(&pop, router, &name).await {
                                Ok(true) => break,
                                Ok(false) => {}
                                Err(e) => {
                                    warn!(interface = %name, error = %e, "teardown: interface release failed, continuing");
                                }
                            }
                        }
                    }
                }
            }
        }

        if let Some(next) = conn.status.apply(ConnectionEvent::TeardownCompleted) {
            conn.status = next;
        }
        drop(conn);

        self.store.delete_connection_record(id).await?;
        self.connections.remove(id);
        info!("teardown complete");
        Ok(())
    }

    /// Snapshot of one connection.
    #[must_use]
    pub async fn get_connection(&self, id: &ConnectionId) -> Option<Connection> {
        let entry = self.connections.get(id).map(|e| Arc::clone(e.value()))?;
        let conn = entry.lock().await;
        Some(conn.clone())
    }

    /// Caller-facing view of one connection.
    pub async fn get_response(&self, id: &ConnectionId) -> Result<ConnectionResponse> {
        let conn = self
            .get_connection(id)
            .await
            .ok_or_else(|| ControllerError::NotFound(format!("connection {id}")))?;
        let message = format!("Status: {}", conn.status.as_str());
        Ok(ConnectionResponse::from_connection(&conn, message))
    }

    /// Snapshots of all connections, optionally filtered by status.
    pub async fn list_connections(&self, filter: Option<ConnectionStatus>) -> Vec<Connection> {
        let entries: Vec<Arc<Mutex<Connection>>> = self
            .connections
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut snapshots = Vec::with_capacity(entries.len());
        for entry in entries {
            let conn = entry.lock().await;
            if filter.is_none_or(|status| conn.status == status) {
                snapshots.push(conn.clone());
            }
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// QoT history of a connection, most recent `limit` samples.
    pub async fn qot_history(&self, id: &ConnectionId, limit: usize) -> Result<Vec<QotSample>> {
        let conn = self
            .get_connection(id)
            .await
            .ok_or_else(|| ControllerError::NotFound(format!("connection {id}")))?;
        let skip = conn.qot_history.len().saturating_sub(limit);
        Ok(conn.qot_history.iter().skip(skip).copied().collect())
    }

    /// Aggregate statistics over the in-memory index.
    pub async fn connection_stats(&self) -> ConnectionStats {
        let snapshots = self.list_connections(None).await;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut bandwidth_total = 0.0;
        let mut reconfig_total = 0;
        for conn in &snapshots {
            *by_status.entry(conn.status.as_str().to_string()).or_insert(0) += 1;
            if matches!(
                conn.status,
                ConnectionStatus::Active
                    | ConnectionStatus::Degraded
                    | ConnectionStatus::Reconfiguring
            ) {
                bandwidth_total += conn.bandwidth_gbps;
            }
            reconfig_total += conn.reconfig_count;
        }
        ConnectionStats {
            total_connections: snapshots.len(),
            by_status,
            bandwidth_total_gbps: bandwidth_total,
            reconfig_count_total: reconfig_total,
        }
    }

    /// Number of live in-memory connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

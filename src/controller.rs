//! Controller wiring and lifecycle.
//!
//! The process entry point constructs one instance of each subsystem
//! and passes them in explicitly; nothing here is a global. `start`
//! loads the topology, rebuilds the connection index from the store,
//! registers the bus callbacks, launches the long-lived tasks
//! (consumer loop, agent reaper, QoT recovery sweep), and announces
//! itself to the agents with a discovery broadcast.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use crate::agents::{AgentDispatcher, AgentRegistry, AgentStatusSummary};
use crate::bus::{BusClient, BusTransport};
use crate::config::ControllerConfig;
use crate::connection::{ConnectionManager, ConnectionRequest, ConnectionResponse};
use crate::domain::{unix_now, ConnectionId, ConnectionStatus, DEFAULT_TX_POWER_DBM};
use crate::error::{ControllerError, Result};
use crate::path::PathComputer;
use crate::qot::{QotMonitor, QotOverview};
use crate::store::ResourceStore;

/// Aggregate health of the controller and its collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_healthy: bool,
    pub connections: usize,
    pub agents: AgentStatusSummary,
    pub qot: QotOverview,
    pub malformed_records: u64,
    pub timestamp: f64,
}

/// One per-tenant controller instance with all subsystems wired.
pub struct Controller {
    config: ControllerConfig,
    store: Arc<dyn ResourceStore>,
    paths: Arc<PathComputer>,
    manager: Arc<ConnectionManager>,
    bus: Arc<BusClient>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<AgentDispatcher>,
    monitor: Arc<QotMonitor>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Builds and starts a controller over the given store and broker
    /// transport.
    #[instrument(skip_all, fields(vop = %config.virtual_operator))]
    pub async fn start(
        config: ControllerConfig,
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn BusTransport>,
    ) -> Result<Arc<Self>> {
        config
            .validate()
            .map_err(|e| ControllerError::InvalidRequest(e.to_string()))?;

        let paths = Arc::new(PathComputer::new(Arc::clone(&store), &config).await?);
        let manager = Arc::new(ConnectionManager::new(Arc::clone(&store), Arc::clone(&paths)));
        manager.reload().await?;

        let bus = Arc::new(BusClient::new(transport, &config));
        let registry = Arc::new(AgentRegistry::new(&config));
        let dispatcher = Arc::new(AgentDispatcher::new(
            Arc::clone(&bus),
            Arc::clone(&registry),
            &config,
        ));
        let monitor = Arc::new(QotMonitor::new(
            Arc::clone(&manager),
            Arc::clone(&dispatcher),
            &config,
        ));

        // Wire the monitoring stream into the registry, the monitor,
        // and the dispatcher's ack log.
        let reg = Arc::clone(&registry);
        bus.register_heartbeat_callback(Arc::new(move |event| {
            let reg = Arc::clone(&reg);
            Box::pin(async move {
                reg.observe_heartbeat(&event);
            })
        }));
        let mon = Arc::clone(&monitor);
        bus.register_telemetry_callback(Arc::new(move |report| {
            let mon = Arc::clone(&mon);
            Box::pin(async move {
                mon.ingest(report).await;
            })
        }));
        let disp = Arc::clone(&dispatcher);
        bus.register_ack_callback(Arc::new(move |ack| {
            let disp = Arc::clone(&disp);
            Box::pin(async move {
                disp.handle_ack(&ack);
            })
        }));

        // The consumer must be live before discovery responses arrive.
        bus.start_consumer().await;

        let (stop_tx, _) = watch::channel(false);
        let tasks = vec![
            registry.spawn_reaper(config.agent_reap_interval, stop_tx.subscribe()),
            monitor.spawn_recovery_sweep(config.recovery_sweep_interval, stop_tx.subscribe()),
        ];

        let controller = Arc::new(Self {
            config,
            store,
            paths,
            manager,
            bus,
            registry,
            dispatcher,
            monitor,
            stop_tx,
            tasks: Mutex::new(tasks),
        });

        if let Err(e) = controller.dispatcher.broadcast_discovery().await {
            warn!(error = %e, "initial discovery broadcast failed");
        }

        info!("controller ready");
        Ok(controller)
    }

    #[must_use]
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<AgentDispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<QotMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<BusClient> {
        &self.bus
    }

    #[must_use]
    pub fn paths(&self) -> &Arc<PathComputer> {
        &self.paths
    }

    /// Provisions a new connection (record + resources); agent commands
    /// go out with [`Controller::setup_connection`].
    pub async fn create_connection(&self, request: ConnectionRequest) -> Result<ConnectionResponse> {
        self.manager.create_connection(request).await
    }

    /// Dispatches `setupConnection` commands to both endpoint agents of
    /// a connection in SETUP_IN_PROGRESS.
    pub async fn setup_connection(&self, id: &ConnectionId) -> Result<()> {
        let conn = self
            .manager
            .get_connection(id)
            .await
            .ok_or_else(|| ControllerError::NotFound(format!("connection {id}")))?;
        if conn.status != ConnectionStatus::SetupInProgress {
            return Err(ControllerError::InvalidRequest(format!(
                "connection {id} is {}, not awaiting setup",
                conn.status.as_str()
            )));
        }
        self.dispatcher
            .dispatch_setup(&conn, DEFAULT_TX_POWER_DBM)
            .await
    }

    /// Marks a connection's setup complete (agents confirmed).
    pub async fn complete_setup(&self, id: &ConnectionId) -> Result<()> {
        self.manager.complete_setup(id).await
    }

    /// Tears a connection down and drops its monitor state.
    pub async fn teardown_connection(&self, id: &ConnectionId) -> Result<()> {
        self.manager.teardown(id).await?;
        self.monitor.forget(id);
        Ok(())
    }

    /// Aggregate health across store, agents, and monitored connections.
    pub async fn health(&self) -> HealthReport {
        let store_healthy = self.store.health_check().await;
        HealthReport {
            healthy: store_healthy,
            store_healthy,
            connections: self.manager.len(),
            agents: self.registry.status_summary(),
            qot: self.monitor.overview().await,
            malformed_records: self.bus.malformed_records(),
            timestamp: unix_now(),
        }
    }

    /// Graceful shutdown: stop the consumer first (bounded join), then
    /// the periodic tasks. In-flight FSM transactions hold their
    /// per-connection mutexes and complete before their callers return,
    /// so nothing is cancelled midway.
    pub async fn shutdown(&self) {
        info!("shutting down controller");
        self.bus.stop_consumer().await;
        let _ = self.stop_tx.send(true);

        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            if timeout(self.config.shutdown_grace, &mut task).await.is_err() {
                warn!("background task did not stop in time, aborting");
                task.abort();
            }
        }
        info!("controller shutdown complete");
    }
}

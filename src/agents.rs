//! Agent registry and command dispatch.
//!
//! The registry tracks every on-switch agent the controller has heard
//! from, keyed `{pop}-{router}`, fed by heartbeat callbacks from the
//! bus consumer. Addressing is best-effort: commands for a pop/router
//! pair fall back to the derived agent id when no live registration
//! exists, relying on broker-side key routing. A periodic reaper
//! evicts agents that have gone silent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, info, instrument, warn};

use crate::bus::{
    BusClient, CommandAck, DiscoveryCommand, EndpointDirection, HeartbeatEvent, HeartbeatStatus,
    InterfaceAction, InterfaceControlCommand, InterfaceParameters, ReconfigCommand,
    ReconfigParameters, SetupCommand, SetupParameters,
};
use crate::config::ControllerConfig;
use crate::domain::{
    channel_frequency_ghz, unix_now, AgentId, AgentStatus, Connection, InterfaceName, PopId,
    ReconfigReason, RouterId,
};
use crate::error::{ControllerError, Result};

/// Everything known about one agent.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub agent_id: AgentId,
    pub pop_id: PopId,
    pub router_id: RouterId,
    pub status: AgentStatus,
    /// Monotonic arrival time of the last heartbeat.
    pub last_heartbeat: Instant,
    /// Wall-clock counterpart, for status reporting only.
    pub last_heartbeat_unix: f64,
    pub capabilities: Vec<String>,
    pub interfaces: Vec<String>,
}

impl AgentInfo {
    /// Online means a heartbeat arrived within the liveness window.
    #[must_use]
    pub fn is_online(&self, window: Duration) -> bool {
        self.last_heartbeat.elapsed() < window
    }
}

/// Aggregate registry view for operators.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusSummary {
    pub total_agents: usize,
    pub online_agents: usize,
    pub offline_agents: usize,
    pub agents_by_pop: HashMap<String, Vec<String>>,
    pub timestamp: f64,
}

/// In-memory agent registry with heartbeat liveness.
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentInfo>,
    heartbeat_window: Duration,
    reap_after: Duration,
}

impl AgentRegistry {
    #[must_use]
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            agents: DashMap::new(),
            heartbeat_window: config.heartbeat_window,
            reap_after: config.agent_reap_after,
        }
    }

    /// Ingests one heartbeat: discovers new agents, refreshes known
    /// ones. Optional capability/interface lists only overwrite when
    /// the heartbeat carries them.
    pub fn observe_heartbeat(&self, event: &HeartbeatEvent) {
        let status = match event.status {
            HeartbeatStatus::Healthy => AgentStatus::Online,
            HeartbeatStatus::Degraded => AgentStatus::Degraded,
        };

        match self.agents.entry(event.agent_id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let pop_id = event
                    .pop_id
                    .clone()
                    .unwrap_or_else(|| PopId::new("unknown".to_string()));
                let router_id = event
                    .router_id
                    .clone()
                    .unwrap_or_else(|| RouterId::new("unknown".to_string()));
                info!(agent = %event.agent_id, pop = %pop_id, router = %router_id, "discovered new agent");
                entry.insert(AgentInfo {
                    agent_id: event.agent_id.clone(),
                    pop_id,
                    router_id,
                    status,
                    last_heartbeat: Instant::now(),
                    last_heartbeat_unix: unix_now(),
                    capabilities: event.capabilities.clone(),
                    interfaces: event.interfaces.clone(),
                });
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let agent = entry.get_mut();
                agent.last_heartbeat = Instant::now();
                agent.last_heartbeat_unix = unix_now();
                agent.status = status;
                if !event.capabilities.is_empty() {
                    agent.capabilities = event.capabilities.clone();
                }
                if !event.interfaces.is_empty() {
                    agent.interfaces = event.interfaces.clone();
                }
            }
        }
    }

    /// Registered agent for a pop/router pair, if any.
    #[must_use]
    pub fn get(&self, pop: &PopId, router: &RouterId) -> Option<AgentInfo> {
        self.agents
            .iter()
            .find(|entry| entry.pop_id == *pop && entry.router_id == *router)
            .map(|entry| entry.clone())
    }

    /// Best-effort addressing: a live registration wins, otherwise the
    /// derived `{pop}-{router}` id lets the command flow before the
    /// first heartbeat.
    #[must_use]
    pub fn resolve(&self, pop: &PopId, router: &RouterId) -> AgentId {
        match self.get(pop, router) {
            Some(agent) if agent.is_online(self.heartbeat_window) => agent.agent_id,
            _ => AgentId::derived(pop, router),
        }
    }

    /// All agents whose last heartbeat is within the liveness window.
    #[must_use]
    pub fn online_agents(&self) -> Vec<AgentInfo> {
        self.agents
            .iter()
            .filter(|entry| entry.is_online(self.heartbeat_window))
            .map(|entry| entry.clone())
            .collect()
    }

    #[must_use]
    pub fn agents_by_pop(&self, pop: &PopId) -> Vec<AgentInfo> {
        self.agents
            .iter()
            .filter(|entry| entry.pop_id == *pop)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Aggregate counts for health reporting.
    #[must_use]
    pub fn status_summary(&self) -> AgentStatusSummary {
        let mut by_pop: HashMap<String, Vec<String>> = HashMap::new();
        let mut online = 0;
        let total = self.agents.len();
        for entry in self.agents.iter() {
            if entry.is_online(self.heartbeat_window) {
                online += 1;
            }
            by_pop
                .entry(entry.pop_id.to_string())
                .or_default()
                .push(entry.agent_id.to_string());
        }
        AgentStatusSummary {
            total_agents: total,
            online_agents: online,
            offline_agents: total - online,
            agents_by_pop: by_pop,
            timestamp: unix_now(),
        }
    }

    /// Evicts agents silent for longer than the reap window, returning
    /// the removed ids.
    pub fn reap_stale(&self) -> Vec<AgentId> {
        let mut evicted = Vec::new();
        self.agents.retain(|id, agent| {
            if agent.last_heartbeat.elapsed() > self.reap_after {
                warn!(agent = %id, "removing stale agent");
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Spawns the periodic reaper task.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.reap_stale();
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "agent reaper evicted stale entries");
                        }
                    }
                }
            }
        })
    }
}

/// Formats and dispatches commands to the agents serving a connection's
/// endpoints.
pub struct AgentDispatcher {
    bus: Arc<BusClient>,
    registry: Arc<AgentRegistry>,
    controller_id: String,
}

impl AgentDispatcher {
    #[must_use]
    pub fn new(bus: Arc<BusClient>, registry: Arc<AgentRegistry>, config: &ControllerConfig) -> Self {
        Self {
            bus,
            registry,
            controller_id: config.controller_id.clone(),
        }
    }

    fn endpoint(
        conn: &Connection,
        direction: EndpointDirection,
    ) -> Result<(PopId, RouterId, Option<InterfaceName>)> {
        let (pop, router, interface) = match direction {
            EndpointDirection::Source => (
                conn.source_pop.clone(),
                conn.source_router.clone(),
                conn.source_interface.clone(),
            ),
            EndpointDirection::Destination => (
                conn.destination_pop.clone(),
                conn.destination_router.clone(),
                conn.destination_interface.clone(),
            ),
        };
        let router = router.ok_or_else(|| {
            ControllerError::Internal(format!(
                "connection {} has no router recorded for its {direction:?} endpoint",
                conn.id
            ))
        })?;
        Ok((pop, router, interface))
    }

    fn path_info(conn: &Connection) -> serde_json::Value {
        serde_json::json!({
            "links": conn.path.iter().map(|s| s.link_id.to_string()).collect::<Vec<_>>(),
            "slots": conn.path.first().map(|s| s.allocated_slots.clone()).unwrap_or_default(),
            "slot_width_ghz": conn.path.first().map(|s| s.slot_width_ghz),
        })
    }

    fn channel_frequency(conn: &Connection) -> Option<f64> {
        conn.path
            .first()
            .and_then(|seg| channel_frequency_ghz(&seg.allocated_slots, seg.slot_width_ghz))
    }

    /// Sends a `setupConnection` command to each endpoint agent. Both
    /// sends must be confirmed for the dispatch to count as done.
    #[instrument(skip(self, conn), fields(conn = %conn.id))]
    pub async fn dispatch_setup(&self, conn: &Connection, tx_power: f64) -> Result<()> {
        let frequency = Self::channel_frequency(conn);
        let path_info = Self::path_info(conn);

        for direction in [EndpointDirection::Source, EndpointDirection::Destination] {
            let (pop, router, interface) = Self::endpoint(conn, direction)?;
            let target = self.registry.resolve(&pop, &router);
            let command = SetupCommand::new(
                conn.id.clone(),
                target.clone(),
                SetupParameters {
                    pop_id: pop,
                    router_id: router,
                    interface,
                    direction,
                    tx_power,
                    frequency,
                    modulation: conn.modulation,
                    path_info: path_info.clone(),
                },
            );
            self.bus.send_command(&command).await?;
            info!(target = %target, ?direction, "setup command dispatched");
        }
        Ok(())
    }

    /// Sends a `reconfigConnection` command with the given absolute Tx
    /// power to each endpoint agent. Fails if either send fails.
    #[instrument(skip(self, conn), fields(conn = %conn.id, reason = reason.as_str()))]
    pub async fn dispatch_reconfig(
        &self,
        conn: &Connection,
        reason: ReconfigReason,
        source_tx_power: f64,
        destination_tx_power: f64,
    ) -> Result<()> {
        let frequency = Self::channel_frequency(conn);

        for (direction, tx_power) in [
            (EndpointDirection::Source, source_tx_power),
            (EndpointDirection::Destination, destination_tx_power),
        ] {
            let (pop, router, interface) = Self::endpoint(conn, direction)?;
            let target = self.registry.resolve(&pop, &router);
            let command = ReconfigCommand::new(
                conn.id.clone(),
                target.clone(),
                reason.as_str(),
                ReconfigParameters {
                    pop_id: pop,
                    router_id: router,
                    interface,
                    tx_power,
                    frequency,
                    modulation: conn.modulation,
                },
            );
            self.bus.send_command(&command).await?;
            info!(target = %target, ?direction, tx_power, "reconfig command dispatched");
        }
        Ok(())
    }

    /// Sends an interface control command, falling back to the derived
    /// agent id when the registry has no live entry.
    #[instrument(skip(self), fields(pop = %pop, router = %router, interface = %interface))]
    pub async fn dispatch_interface_command(
        &self,
        action: InterfaceAction,
        pop: &PopId,
        router: &RouterId,
        interface: &InterfaceName,
    ) -> Result<()> {
        let target = self.registry.resolve(pop, router);
        let command = InterfaceControlCommand::new(
            target.clone(),
            InterfaceParameters {
                pop_id: pop.clone(),
                router_id: router.clone(),
                interface: interface.clone(),
                action,
            },
        );
        self.bus.send_command(&command).await?;
        info!(target = %target, ?action, "interface command dispatched");
        Ok(())
    }

    /// Broadcasts a discovery request; agents respond on the monitoring
    /// topic with heartbeats.
    pub async fn broadcast_discovery(&self) -> Result<()> {
        self.bus
            .send_command(&DiscoveryCommand::new(self.controller_id.clone()))
            .await?;
        info!("discovery broadcast sent");
        Ok(())
    }

    /// Ack callback target; acknowledgements are informational.
    pub fn handle_ack(&self, ack: &CommandAck) {
        info!(
            command = %ack.command_id,
            agent = %ack.agent_id,
            status = %ack.status,
            "command acknowledged"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(agent: &str, pop: &str, router: &str) -> HeartbeatEvent {
        HeartbeatEvent {
            agent_id: AgentId::new(agent.to_string()),
            status: HeartbeatStatus::Healthy,
            pop_id: Some(PopId::new(pop.to_string())),
            router_id: Some(RouterId::new(router.to_string())),
            capabilities: vec!["cmis".to_string()],
            interfaces: Vec::new(),
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::new(&ControllerConfig::testing())
    }

    #[tokio::test]
    async fn first_heartbeat_discovers_the_agent() {
        let registry = registry();
        registry.observe_heartbeat(&heartbeat("pop1-r1", "pop1", "r1"));

        let agent = registry
            .get(
                &PopId::new("pop1".to_string()),
                &RouterId::new("r1".to_string()),
            )
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.capabilities, vec!["cmis"]);
    }

    #[tokio::test]
    async fn refresh_keeps_capabilities_when_heartbeat_omits_them() {
        let registry = registry();
        registry.observe_heartbeat(&heartbeat("pop1-r1", "pop1", "r1"));

        let mut refresh = heartbeat("pop1-r1", "pop1", "r1");
        refresh.capabilities = Vec::new();
        refresh.status = HeartbeatStatus::Degraded;
        registry.observe_heartbeat(&refresh);

        let agent = registry
            .get(
                &PopId::new("pop1".to_string()),
                &RouterId::new("r1".to_string()),
            )
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Degraded);
        assert_eq!(agent.capabilities, vec!["cmis"]);
    }

    #[tokio::test]
    async fn resolve_falls_back_to_derived_id() {
        let registry = registry();
        let pop = PopId::new("pop9".to_string());
        let router = RouterId::new("r2".to_string());
        assert_eq!(registry.resolve(&pop, &router).to_string(), "pop9-r2");

        registry.observe_heartbeat(&heartbeat("pop9-r2", "pop9", "r2"));
        assert_eq!(registry.resolve(&pop, &router).to_string(), "pop9-r2");
    }

    #[tokio::test]
    async fn stale_agents_are_reaped() {
        tokio::time::pause();
        let registry = registry();
        registry.observe_heartbeat(&heartbeat("pop1-r1", "pop1", "r1"));

        // testing() reaps after 2 s of silence.
        tokio::time::advance(Duration::from_secs(3)).await;
        let evicted = registry.reap_stale();
        assert_eq!(evicted.len(), 1);
        assert!(registry
            .get(
                &PopId::new("pop1".to_string()),
                &RouterId::new("r1".to_string()),
            )
            .is_none());
    }

    #[tokio::test]
    async fn liveness_window_is_a_hard_edge() {
        tokio::time::pause();
        let registry = registry();
        registry.observe_heartbeat(&heartbeat("pop1-r1", "pop1", "r1"));
        let pop = PopId::new("pop1".to_string());
        let router = RouterId::new("r1".to_string());

        tokio::time::advance(Duration::from_millis(59_900)).await;
        assert!(registry.get(&pop, &router).unwrap().is_online(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!registry.get(&pop, &router).unwrap().is_online(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn summary_counts_online_and_offline() {
        tokio::time::pause();
        let registry = registry();
        registry.observe_heartbeat(&heartbeat("pop1-r1", "pop1", "r1"));
        tokio::time::advance(Duration::from_secs(61)).await;
        registry.observe_heartbeat(&heartbeat("pop2-r1", "pop2", "r1"));

        let summary = registry.status_summary();
        assert_eq!(summary.total_agents, 2);
        assert_eq!(summary.online_agents, 1);
        assert_eq!(summary.offline_agents, 1);
        assert!(summary.agents_by_pop.contains_key("pop1"));
    }
}

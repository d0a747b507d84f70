//! Command builders for the controller-to-agent stream.
//!
//! Every command carries a fresh UUID `command_id`, a wall-clock
//! `timestamp`, and its `target_agent` (the partition key). Discovery
//! broadcasts carry no target and reach every agent on the topic.

use serde::Serialize;
use uuid::Uuid;

use crate::domain::{unix_now, AgentId, ConnectionId, InterfaceName, Modulation, PopId, RouterId};

/// Common shape of an outbound command: its partition key.
pub trait Command: Serialize {
    /// Target agent used as the partition key; `None` broadcasts.
    fn key(&self) -> Option<&AgentId>;
}

/// Which end of the connection an endpoint command configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointDirection {
    Source,
    Destination,
}

/// Transceiver parameters for one end of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct SetupParameters {
    pub pop_id: PopId,
    pub router_id: RouterId,
    pub interface: Option<InterfaceName>,
    pub direction: EndpointDirection,
    pub tx_power: f64,
    pub frequency: Option<f64>,
    pub modulation: Modulation,
    pub path_info: serde_json::Value,
}

/// `setupConnection`: program one endpoint of a new connection.
#[derive(Debug, Clone, Serialize)]
pub struct SetupCommand {
    #[serde(rename = "type")]
    pub command_type: &'static str,
    pub command_id: String,
    pub timestamp: f64,
    pub target_agent: AgentId,
    pub connection_id: ConnectionId,
    pub parameters: SetupParameters,
}

impl SetupCommand {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        target_agent: AgentId,
        parameters: SetupParameters,
    ) -> Self {
        Self {
            command_type: "setupConnection",
            command_id: Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            target_agent,
            connection_id,
            parameters,
        }
    }
}

impl Command for SetupCommand {
    fn key(&self) -> Option<&AgentId> {
        Some(&self.target_agent)
    }
}

/// Adjusted transceiver parameters for one end during reconfiguration.
#[derive(Debug, Clone, Serialize)]
pub struct ReconfigParameters {
    pub pop_id: PopId,
    pub router_id: RouterId,
    pub interface: Option<InterfaceName>,
    pub tx_power: f64,
    pub frequency: Option<f64>,
    pub modulation: Modulation,
}

/// `reconfigConnection`: retune one endpoint of a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ReconfigCommand {
    #[serde(rename = "type")]
    pub command_type: &'static str,
    pub command_id: String,
    pub timestamp: f64,
    pub target_agent: AgentId,
    pub connection_id: ConnectionId,
    pub reason: String,
    pub parameters: ReconfigParameters,
}

impl ReconfigCommand {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        target_agent: AgentId,
        reason: impl Into<String>,
        parameters: ReconfigParameters,
    ) -> Self {
        Self {
            command_type: "reconfigConnection",
            command_id: Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            target_agent,
            connection_id,
            reason: reason.into(),
            parameters,
        }
    }
}

impl Command for ReconfigCommand {
    fn key(&self) -> Option<&AgentId> {
        Some(&self.target_agent)
    }
}

/// Administrative interface actions an agent can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceAction {
    Up,
    Down,
    AdminDown,
}

/// Identification of the interface an action applies to.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceParameters {
    pub pop_id: PopId,
    pub router_id: RouterId,
    pub interface: InterfaceName,
    pub action: InterfaceAction,
}

/// `interfaceControl`: bring an interface up or down.
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceControlCommand {
    #[serde(rename = "type")]
    pub command_type: &'static str,
    pub command_id: String,
    pub timestamp: f64,
    pub target_agent: AgentId,
    pub action: InterfaceAction,
    pub parameters: InterfaceParameters,
}

impl InterfaceControlCommand {
    #[must_use]
    pub fn new(target_agent: AgentId, parameters: InterfaceParameters) -> Self {
        Self {
            command_type: "interfaceControl",
            command_id: Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            target_agent,
            action: parameters.action,
            parameters,
        }
    }
}

impl Command for InterfaceControlCommand {
    fn key(&self) -> Option<&AgentId> {
        Some(&self.target_agent)
    }
}

/// `discovery`: broadcast asking every agent on the topic to respond
/// with a heartbeat carrying its capabilities.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryCommand {
    #[serde(rename = "type")]
    pub command_type: &'static str,
    pub command_id: String,
    pub timestamp: f64,
    pub action: &'static str,
    pub parameters: DiscoveryParameters,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryParameters {
    pub controller_id: String,
}

impl DiscoveryCommand {
    #[must_use]
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            command_type: "discovery",
            command_id: Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            action: "discover",
            parameters: DiscoveryParameters {
                controller_id: controller_id.into(),
            },
        }
    }
}

impl Command for DiscoveryCommand {
    fn key(&self) -> Option<&AgentId> {
        None
    }
}

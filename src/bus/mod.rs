//! Agent messaging layer.
//!
//! The controller produces keyed JSON commands on the per-tenant
//! `config_<vop>` topic and consumes heartbeats, telemetry, and command
//! acknowledgements from `monitoring_<vop>`. The broker itself is an
//! external collaborator reached through the [`BusTransport`] seam;
//! [`InProcessBroker`] is the channel-backed implementation used by
//! tests and single-process deployments. Per-agent ordering rests on
//! the agent id being the partition key for every command.

mod client;
mod commands;
mod messages;
mod transport;

pub use client::{AckCallback, BusClient, HeartbeatCallback, TelemetryCallback};
pub use commands::{
    Command, DiscoveryCommand, DiscoveryParameters, EndpointDirection, InterfaceAction,
    InterfaceControlCommand, InterfaceParameters, ReconfigCommand, ReconfigParameters,
    SetupCommand, SetupParameters,
};
pub use messages::{
    parse_monitoring, CommandAck, HeartbeatEvent, HeartbeatStatus, MonitoringEvent,
    TelemetryReport,
};
pub use transport::{BusTransport, InProcessBroker, Record};

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by bus operations, unchanged, to the caller.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker did not confirm the send within the request timeout.
    #[error("send to {topic} not confirmed within {timeout:?}")]
    SendTimeout { topic: String, timeout: Duration },

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),
}

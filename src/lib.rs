//! # lightpathd: control core for sliced IP-over-WDM networks
//!
//! A per-tenant ("virtual operator") SDN controller core for optical
//! transport networks. Each instance owns a slice of routers and
//! spectrum, provisions end-to-end optical connections between POPs,
//! watches their quality of transmission in real time, and reacts to
//! degradation by retuning transceivers through on-switch agents.
//!
//! ## Subsystems
//!
//! - [`store`]: persistent topology, interface, spectrum-slot, and
//!   connection state behind the [`store::ResourceStore`] trait.
//! - [`path`]: shortest-path routing plus first-fit spectrum assignment
//!   with slot continuity along the path.
//! - [`connection`]: the connection state machine and the
//!   multi-resource create/teardown transactions.
//! - [`bus`]: keyed command/telemetry exchange with agents over the
//!   two per-tenant topics, behind the [`bus::BusTransport`] seam.
//! - [`agents`]: heartbeat-fed agent registry with best-effort
//!   addressing, and the command dispatcher.
//! - [`qot`]: persistency-based degradation detection and the bounded
//!   reconfiguration loop with cooldown.
//!
//! [`controller::Controller`] wires one instance of each together; the
//! binary in `main.rs` is a thin shell around it.

pub mod agents;
pub mod bus;
pub mod config;
pub mod connection;
pub mod controller;
pub mod domain;
pub mod error;
pub mod path;
pub mod qot;
pub mod store;

pub use agents::{AgentDispatcher, AgentInfo, AgentRegistry};
pub use bus::{BusClient, BusError, BusTransport, InProcessBroker};
pub use config::{AdjustMode, ControllerConfig};
pub use connection::{ConnectionManager, ConnectionRequest, ConnectionResponse};
pub use controller::Controller;
pub use domain::{
    AgentId, Connection, ConnectionId, ConnectionStatus, DegradationLevel, InterfaceName, LinkId,
    Modulation, NetworkLink, PathSegment, PopId, PopNode, QotSample, RouterId,
};
pub use error::{ControllerError, Result};
pub use path::PathComputer;
pub use qot::QotMonitor;
pub use store::{ResourceStore, SqliteResourceStore, StoreError};

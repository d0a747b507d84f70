//! Domain types for the controller core.
//!
//! Strongly-typed identifiers and the data model shared by every
//! subsystem: topology nodes and links, path segments, connection
//! records, agent descriptors, and QoT telemetry samples.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use nutype::nutype;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a Point-of-Presence (aggregation site).
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef,
    Deref
))]
pub struct PopId(String);

/// Identifier of a router within a POP.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef,
    Deref
))]
pub struct RouterId(String);

/// Identifier of an optical link between two POPs.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef,
    Deref
))]
pub struct LinkId(String);

/// Name of a router interface, unique within (pop, router).
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef,
    Deref
))]
pub struct InterfaceName(String);

/// Identifier of a provisioned connection.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef,
    Deref
))]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a fresh connection id of the form `conn-<8 hex chars>`.
    #[must_use]
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self::new(format!("conn-{}", &hex[..8]))
    }
}

/// Identifier of an on-switch agent, always `{pop}-{router}`.
#[nutype(derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    From,
    Into,
    AsRef,
    Deref
))]
pub struct AgentId(String);

impl AgentId {
    /// Deterministic agent id shared between controller and agent.
    #[must_use]
    pub fn derived(pop: &PopId, router: &RouterId) -> Self {
        Self::new(format!("{pop}-{router}"))
    }
}

/// Anchor of the 12.5 GHz C-band frequency grid, in GHz.
pub const C_BAND_BASE_GHZ: f64 = 191_300.0;

/// Tx power programmed at setup and assumed before the first
/// correction, dBm.
pub const DEFAULT_TX_POWER_DBM: f64 = -10.0;

/// Slots spanning the C-band on every link unless the store says otherwise.
pub const DEFAULT_TOTAL_SLOTS: u16 = 320;

/// Center frequency of a contiguous slot run on the C-band grid.
///
/// Returns `None` for an empty run.
#[must_use]
pub fn channel_frequency_ghz(slots: &[u16], slot_width_ghz: f64) -> Option<f64> {
    let first = *slots.first()?;
    Some(C_BAND_BASE_GHZ + (f64::from(first) + slots.len() as f64 / 2.0) * slot_width_ghz)
}

/// Current unix time in seconds, as carried in wire messages.
#[must_use]
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Modulation format of a transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modulation {
    #[serde(rename = "DP-QPSK")]
    DpQpsk,
    #[serde(rename = "DP-8QAM")]
    Dp8Qam,
    #[serde(rename = "DP-16QAM")]
    Dp16Qam,
}

impl Modulation {
    /// Spectral efficiency in bit/s/Hz used when the configuration does
    /// not override it.
    #[must_use]
    pub fn default_spectral_efficiency(self) -> f64 {
        match self {
            Self::DpQpsk => 2.0,
            Self::Dp8Qam => 3.0,
            Self::Dp16Qam => 4.0,
        }
    }

    /// Wire name of the format, e.g. `DP-16QAM`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DpQpsk => "DP-QPSK",
            Self::Dp8Qam => "DP-8QAM",
            Self::Dp16Qam => "DP-16QAM",
        }
    }
}

impl std::fmt::Display for Modulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Modulation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DP-QPSK" => Ok(Self::DpQpsk),
            "DP-8QAM" => Ok(Self::Dp8Qam),
            "DP-16QAM" => Ok(Self::Dp16Qam),
            other => Err(format!("unknown modulation format: {other}")),
        }
    }
}

/// A POP with its routers and interface inventory. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopNode {
    pub id: PopId,
    pub name: String,
    pub location: Option<String>,
    pub routers: Vec<RouterId>,
    pub interfaces: Vec<InterfaceName>,
}

/// An optical link between two POPs. Slot occupancy lives in the
/// resource store; this snapshot is immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkLink {
    pub id: LinkId,
    pub pop_a: PopId,
    pub pop_b: PopId,
    pub length_km: f64,
    pub total_slots: u16,
}

/// One hop of a provisioned path with its allocated spectrum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSegment {
    pub link_id: LinkId,
    pub source_pop: PopId,
    pub destination_pop: PopId,
    pub allocated_slots: Vec<u16>,
    pub slot_width_ghz: f64,
}

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Pending,
    SetupInProgress,
    Active,
    Degraded,
    Reconfiguring,
    TeardownInProgress,
    Failed,
    Terminated,
}

impl ConnectionStatus {
    /// True for states that no longer hold resources.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Wire/store name of the status, e.g. `SETUP_IN_PROGRESS`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::SetupInProgress => "SETUP_IN_PROGRESS",
            Self::Active => "ACTIVE",
            Self::Degraded => "DEGRADED",
            Self::Reconfiguring => "RECONFIGURING",
            Self::TeardownInProgress => "TEARDOWN_IN_PROGRESS",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        }
    }

    /// The transition table. Returns the next state, or `None` when the
    /// event is not legal in the current state.
    #[must_use]
    pub fn apply(self, event: ConnectionEvent) -> Option<Self> {
        use ConnectionEvent as E;
        use ConnectionStatus as S;

        match (self, event) {
            (S::Pending, E::SetupRequested) => Some(S::SetupInProgress),
            (S::Pending, E::SetupFailed) => Some(S::Failed),
            (S::SetupInProgress, E::SetupCompleted) => Some(S::Active),
            (S::SetupInProgress, E::SetupFailed) => Some(S::Failed),
            (S::SetupInProgress, E::TeardownRequested) => Some(S::TeardownInProgress),
            (S::Active, E::DegradationDetected) => Some(S::Degraded),
            (S::Active, E::ReconfigRequested) => Some(S::Reconfiguring),
            (S::Active, E::TeardownRequested) => Some(S::TeardownInProgress),
            (S::Degraded, E::ReconfigRequested) => Some(S::Reconfiguring),
            (S::Degraded, E::TeardownRequested) => Some(S::TeardownInProgress),
            (S::Reconfiguring, E::ReconfigCompleted) => Some(S::Active),
            (S::Reconfiguring, E::ReconfigFailed) => Some(S::Degraded),
            (S::Reconfiguring, E::TeardownRequested) => Some(S::TeardownInProgress),
            (S::TeardownInProgress, E::TeardownCompleted) => Some(S::Terminated),
            (S::TeardownInProgress, E::TeardownFailed) => Some(S::Failed),
            (S::Failed, E::TeardownRequested) => Some(S::TeardownInProgress),
            _ => None,
        }
    }
}

impl std::str::FromStr for ConnectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SETUP_IN_PROGRESS" => Ok(Self::SetupInProgress),
            "ACTIVE" => Ok(Self::Active),
            "DEGRADED" => Ok(Self::Degraded),
            "RECONFIGURING" => Ok(Self::Reconfiguring),
            "TEARDOWN_IN_PROGRESS" => Ok(Self::TeardownInProgress),
            "FAILED" => Ok(Self::Failed),
            "TERMINATED" => Ok(Self::Terminated),
            other => Err(format!("unknown connection status: {other}")),
        }
    }
}

/// Events driving the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionEvent {
    SetupRequested,
    SetupCompleted,
    SetupFailed,
    DegradationDetected,
    ReconfigRequested,
    ReconfigCompleted,
    ReconfigFailed,
    TeardownRequested,
    TeardownCompleted,
    TeardownFailed,
}

/// Reason attached to a reconfiguration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconfigReason {
    QotDegradation,
    OperatorRequest,
}

impl ReconfigReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QotDegradation => "QOT_DEGRADATION",
            Self::OperatorRequest => "OPERATOR_REQUEST",
        }
    }
}

/// One QoT reading for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QotSample {
    pub timestamp: f64,
    pub osnr: Option<f64>,
    pub pre_fec_ber: Option<f64>,
    pub post_fec_ber: Option<f64>,
    pub tx_power: Option<f64>,
    pub rx_power: Option<f64>,
}

impl QotSample {
    /// A sample with neither OSNR nor pre-FEC BER carries no signal
    /// quality information.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.osnr.is_some() || self.pre_fec_ber.is_some()
    }
}

/// QoT degradation level of a monitored connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationLevel {
    Normal,
    Warning,
    Degraded,
    Critical,
}

/// Samples retained per connection, both in the connection record and
/// in the monitor state.
pub const QOT_HISTORY_CAP: usize = 100;

/// In-memory state of a provisioned connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub source_pop: PopId,
    pub destination_pop: PopId,
    pub source_interface: Option<InterfaceName>,
    pub destination_interface: Option<InterfaceName>,
    /// Router that holds the allocated source interface, when one was
    /// allocated during create.
    pub source_router: Option<RouterId>,
    pub destination_router: Option<RouterId>,
    pub path: Vec<PathSegment>,
    pub bandwidth_gbps: f64,
    pub modulation: Modulation,
    pub status: ConnectionStatus,
    /// Unix seconds at which the connection record was created.
    pub setup_time: f64,
    pub estimated_osnr: Option<f64>,
    pub qot_history: VecDeque<QotSample>,
    pub last_reconfig_time: Option<f64>,
    pub reconfig_count: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Connection {
    /// Appends a sample, keeping at most [`QOT_HISTORY_CAP`] readings.
    pub fn push_qot_sample(&mut self, sample: QotSample) {
        if self.qot_history.len() == QOT_HISTORY_CAP {
            self.qot_history.pop_front();
        }
        self.qot_history.push_back(sample);
    }
}

/// Liveness status of an on-switch agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Online,
    Degraded,
    Offline,
    Unknown,
}

/// Interface allocation state as held in the resource store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceState {
    Available,
    Occupied,
}

impl InterfaceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Occupied => "OCCUPIED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derived_agent_id_joins_pop_and_router() {
        let id = AgentId::derived(
            &PopId::new("pop1".to_string()),
            &RouterId::new("router1".to_string()),
        );
        assert_eq!(id.to_string(), "pop1-router1");
    }

    #[test]
    fn generated_connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[test]
    fn channel_frequency_sits_on_the_grid() {
        // Two slots starting at index 0: center one slot above the base.
        let f = channel_frequency_ghz(&[0, 1], 12.5).unwrap();
        assert!((f - 191_312.5).abs() < f64::EPSILON);
        assert_eq!(channel_frequency_ghz(&[], 12.5), None);
    }

    #[test]
    fn terminal_states_accept_nothing_new() {
        for event in ALL_EVENTS {
            assert_eq!(ConnectionStatus::Terminated.apply(event), None);
        }
    }

    #[test]
    fn qot_history_is_bounded() {
        let mut conn = Connection {
            id: ConnectionId::generate(),
            source_pop: PopId::new("A".to_string()),
            destination_pop: PopId::new("B".to_string()),
            source_interface: None,
            destination_interface: None,
            source_router: None,
            destination_router: None,
            path: Vec::new(),
            bandwidth_gbps: 100.0,
            modulation: Modulation::Dp16Qam,
            status: ConnectionStatus::Active,
            setup_time: 0.0,
            estimated_osnr: None,
            qot_history: VecDeque::new(),
            last_reconfig_time: None,
            reconfig_count: 0,
            metadata: serde_json::Map::new(),
        };

        for i in 0..250 {
            conn.push_qot_sample(QotSample {
                timestamp: f64::from(i),
                osnr: Some(20.0),
                pre_fec_ber: None,
                post_fec_ber: None,
                tx_power: None,
                rx_power: None,
            });
        }
        assert_eq!(conn.qot_history.len(), QOT_HISTORY_CAP);
        assert_eq!(conn.qot_history.front().unwrap().timestamp, 150.0);
    }

    const ALL_STATES: [ConnectionStatus; 8] = [
        ConnectionStatus::Pending,
        ConnectionStatus::SetupInProgress,
        ConnectionStatus::Active,
        ConnectionStatus::Degraded,
        ConnectionStatus::Reconfiguring,
        ConnectionStatus::TeardownInProgress,
        ConnectionStatus::Failed,
        ConnectionStatus::Terminated,
    ];

    const ALL_EVENTS: [ConnectionEvent; 10] = [
        ConnectionEvent::SetupRequested,
        ConnectionEvent::SetupCompleted,
        ConnectionEvent::SetupFailed,
        ConnectionEvent::DegradationDetected,
        ConnectionEvent::ReconfigRequested,
        ConnectionEvent::ReconfigCompleted,
        ConnectionEvent::ReconfigFailed,
        ConnectionEvent::TeardownRequested,
        ConnectionEvent::TeardownCompleted,
        ConnectionEvent::TeardownFailed,
    ];

    proptest! {
        /// Any event sequence keeps the machine inside the known state
        /// set, and a rejected event leaves the state untouched.
        #[test]
        fn fsm_never_leaves_the_state_table(events in proptest::collection::vec(0usize..10, 0..64)) {
            let mut status = ConnectionStatus::Pending;
            for idx in events {
                let event = ALL_EVENTS[idx];
                match status.apply(event) {
                    Some(next) => {
                        prop_assert!(ALL_STATES.contains(&next));
                        status = next;
                    }
                    None => {
                        prop_assert!(ALL_STATES.contains(&status));
                    }
                }
            }
        }

        /// TERMINATED is the only state with no outgoing transitions.
        #[test]
        fn only_terminated_is_terminal(state_idx in 0usize..8) {
            let state = ALL_STATES[state_idx];
            let has_exit = ALL_EVENTS.iter().any(|&e| state.apply(e).is_some());
            prop_assert_eq!(has_exit, state != ConnectionStatus::Terminated);
        }
    }
}

//! Inbound monitoring-stream parsing.
//!
//! Agent payloads are loose: the type tag varies in case and spelling,
//! and fields may sit flat on the message or nested under `payload`.
//! The parser tries the flat shape first, then the payload sub-object,
//! and classifies anything unusable as malformed instead of letting it
//! near the consumer loop's control flow.

use serde_json::Value;

use crate::domain::{AgentId, ConnectionId, PopId, QotSample, RouterId};

/// Normalized health carried by a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Healthy,
    Degraded,
}

/// A heartbeat or agent-health report.
#[derive(Debug, Clone)]
pub struct HeartbeatEvent {
    pub agent_id: AgentId,
    pub status: HeartbeatStatus,
    pub pop_id: Option<PopId>,
    pub router_id: Option<RouterId>,
    pub capabilities: Vec<String>,
    pub interfaces: Vec<String>,
}

/// A per-connection QoT telemetry report.
#[derive(Debug, Clone)]
pub struct TelemetryReport {
    pub agent_id: AgentId,
    pub connection_id: ConnectionId,
    pub sample: QotSample,
}

/// An agent's acknowledgement of a command.
#[derive(Debug, Clone)]
pub struct CommandAck {
    pub command_id: String,
    pub agent_id: AgentId,
    pub status: String,
}

/// Classified monitoring record.
#[derive(Debug, Clone)]
pub enum MonitoringEvent {
    Heartbeat(HeartbeatEvent),
    Telemetry(TelemetryReport),
    Ack(CommandAck),
    /// Recognized type the controller has no interest in.
    Ignored,
    /// Unusable record; the consumer counts and logs these.
    Malformed { reason: String },
}

/// Field lookup: flat shape first, then under `payload`.
fn field<'a>(msg: &'a Value, key: &str) -> Option<&'a Value> {
    msg.get(key)
        .or_else(|| msg.get("payload").and_then(|p| p.get(key)))
}

fn field_str(msg: &Value, key: &str) -> Option<String> {
    field(msg, key).and_then(Value::as_str).map(str::to_string)
}

fn field_f64(msg: &Value, key: &str) -> Option<f64> {
    field(msg, key).and_then(Value::as_f64)
}

fn field_str_list(msg: &Value, key: &str) -> Vec<String> {
    field(msg, key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn malformed(reason: impl Into<String>) -> MonitoringEvent {
    MonitoringEvent::Malformed {
        reason: reason.into(),
    }
}

/// Parses one record from the monitoring topic.
#[must_use]
pub fn parse_monitoring(msg: &Value) -> MonitoringEvent {
    if !msg.is_object() {
        return malformed("record is not a JSON object");
    }

    let Some(kind) = msg
        .get("type")
        .or_else(|| msg.get("message_type"))
        .and_then(Value::as_str)
    else {
        return malformed("missing type tag");
    };

    match kind.to_ascii_lowercase().as_str() {
        "agenthealth" | "agentheartbeat" | "health" | "heartbeat" => parse_heartbeat(msg),
        "telemetry" | "agenttelemetry" | "monitoring" | "qottelemetry" => parse_telemetry(msg),
        "commandack" | "ack" | "command_ack" => parse_ack(msg),
        _ => MonitoringEvent::Ignored,
    }
}

fn parse_heartbeat(msg: &Value) -> MonitoringEvent {
    let Some(agent_id) = field_str(msg, "agent_id") else {
        return malformed("heartbeat without agent_id");
    };

    let status = match field_str(msg, "status") {
        Some(raw) if matches!(raw.to_ascii_lowercase().as_str(), "healthy" | "ok" | "up") => {
            HeartbeatStatus::Healthy
        }
        _ => HeartbeatStatus::Degraded,
    };

    MonitoringEvent::Heartbeat(HeartbeatEvent {
        agent_id: AgentId::new(agent_id),
        status,
        pop_id: field_str(msg, "pop_id").map(PopId::new),
        router_id: field_str(msg, "router_id").map(RouterId::new),
        capabilities: field_str_list(msg, "capabilities"),
        interfaces: field_str_list(msg, "interfaces"),
    })
}

fn parse_telemetry(msg: &Value) -> MonitoringEvent {
    let Some(agent_id) = field_str(msg, "agent_id") else {
        return malformed("telemetry without agent_id");
    };
    let Some(connection_id) = field_str(msg, "connection_id") else {
        return malformed("telemetry without connection_id");
    };

    let sample = QotSample {
        timestamp: field_f64(msg, "timestamp").unwrap_or_else(crate::domain::unix_now),
        osnr: field_f64(msg, "osnr"),
        pre_fec_ber: field_f64(msg, "pre_fec_ber"),
        post_fec_ber: field_f64(msg, "post_fec_ber"),
        tx_power: field_f64(msg, "tx_power"),
        rx_power: field_f64(msg, "rx_power"),
    };

    MonitoringEvent::Telemetry(TelemetryReport {
        agent_id: AgentId::new(agent_id),
        connection_id: ConnectionId::new(connection_id),
        sample,
    })
}

fn parse_ack(msg: &Value) -> MonitoringEvent {
    let Some(command_id) = field_str(msg, "command_id") else {
        return malformed("ack without command_id");
    };
    let Some(agent_id) = field_str(msg, "agent_id") else {
        return malformed("ack without agent_id");
    };
    let status = field_str(msg, "ack_status")
        .or_else(|| field_str(msg, "status"))
        .unwrap_or_else(|| "unknown".to_string());

    MonitoringEvent::Ack(CommandAck {
        command_id,
        agent_id: AgentId::new(agent_id),
        status,
    })
}

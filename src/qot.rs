//! QoT monitoring and closed-loop reconfiguration.
//!
//! Ingests per-connection telemetry, classifies degradation with a
//! persistency requirement (N consecutive samples), and reacts with a
//! bounded number of Tx-power corrections separated by a cooldown.
//! Errors never propagate upward from here: a failed correction leaves
//! the connection DEGRADED for the recovery sweep or the operator.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::agents::AgentDispatcher;
use crate::bus::TelemetryReport;
use crate::config::{AdjustMode, ControllerConfig};
use crate::connection::ConnectionManager;
use crate::domain::{
    unix_now, ConnectionId, DegradationLevel, QotSample, ReconfigReason, DEFAULT_TX_POWER_DBM,
    QOT_HISTORY_CAP,
};

/// Monitor state for one connection.
#[derive(Debug)]
struct QotState {
    samples: VecDeque<QotSample>,
    level: DegradationLevel,
    last_degradation: Option<Instant>,
    reconfig_count: u32,
    last_reconfig: Option<Instant>,
    last_reconfig_unix: Option<f64>,
    cooldown_until: Option<Instant>,
    source_tx_dbm: f64,
    destination_tx_dbm: f64,
}

impl QotState {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            level: DegradationLevel::Normal,
            last_degradation: None,
            reconfig_count: 0,
            last_reconfig: None,
            last_reconfig_unix: None,
            cooldown_until: None,
            source_tx_dbm: DEFAULT_TX_POWER_DBM,
            destination_tx_dbm: DEFAULT_TX_POWER_DBM,
        }
    }

    fn push(&mut self, sample: QotSample) {
        if self.samples.len() == QOT_HISTORY_CAP {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_until
            .is_some_and(|until| Instant::now() < until)
    }

    fn tail(&self, n: usize) -> Vec<QotSample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip).copied().collect()
    }
}

/// Caller-facing QoT status of one connection.
#[derive(Debug, Clone, Serialize)]
pub struct QotStatus {
    pub connection_id: ConnectionId,
    pub degradation_level: DegradationLevel,
    pub reconfig_count: u32,
    pub in_cooldown: bool,
    pub last_reconfig_time: Option<f64>,
    pub recent_samples: Vec<QotSample>,
}

/// Fleet-wide QoT overview.
#[derive(Debug, Clone, Serialize)]
pub struct QotOverview {
    pub total_monitored: usize,
    pub degraded_connections: usize,
    pub critical_connections: usize,
    pub timestamp: f64,
}

/// Closed-loop QoT controller.
pub struct QotMonitor {
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<AgentDispatcher>,
    states: DashMap<ConnectionId, Arc<Mutex<QotState>>>,
    osnr_threshold: f64,
    critical_osnr: f64,
    ber_threshold: f64,
    persistency: usize,
    cooldown: Duration,
    tx_step: f64,
    tx_min: f64,
    tx_max: f64,
    adjust_mode: AdjustMode,
    max_reconfig_attempts: u32,
}

impl QotMonitor {
    #[must_use]
    pub fn new(
        manager: Arc<ConnectionManager>,
        dispatcher: Arc<AgentDispatcher>,
        config: &ControllerConfig,
    ) -> Self {
        info!(
            osnr_threshold = config.osnr_threshold_db,
            ber_threshold = config.ber_threshold,
            persistency = config.persistency_samples,
            cooldown_sec = config.cooldown.as_secs_f64(),
            "QoT monitor initialized"
        );
        Self {
            manager,
            dispatcher,
            states: DashMap::new(),
            osnr_threshold: config.osnr_threshold_db,
            critical_osnr: config.critical_osnr_db,
            ber_threshold: config.ber_threshold,
            persistency: config.persistency_samples,
            cooldown: config.cooldown,
            tx_step: config.tx_step_db,
            tx_min: config.tx_min_dbm,
            tx_max: config.tx_max_dbm,
            adjust_mode: config.adjust_mode,
            max_reconfig_attempts: config.max_reconfig_attempts,
        }
    }

    fn state(&self, id: &ConnectionId) -> Arc<Mutex<QotState>> {
        self.states
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(QotState::new())))
            .clone()
    }

    fn is_critical(&self, sample: &QotSample) -> bool {
        sample.osnr.is_some_and(|osnr| osnr < self.critical_osnr)
            || sample
                .pre_fec_ber
                .is_some_and(|ber| ber > self.ber_threshold * 10.0)
    }

    fn is_at_least_degraded(&self, sample: &QotSample) -> bool {
        self.is_critical(sample)
            || sample.osnr.is_some_and(|osnr| osnr < self.osnr_threshold)
            || sample
                .pre_fec_ber
                .is_some_and(|ber| ber > self.ber_threshold)
    }

    fn within_thresholds(&self, sample: &QotSample) -> bool {
        sample.osnr.is_none_or(|osnr| osnr >= self.osnr_threshold)
            && sample
                .pre_fec_ber
                .is_none_or(|ber| ber <= self.ber_threshold)
    }

    /// Classifies the most recent persistency window. Every one of the
    /// last N samples must agree before the level moves off NORMAL.
    fn classify(&self, tail: &[QotSample]) -> DegradationLevel {
        if tail.len() < self.persistency {
            return DegradationLevel::Normal;
        }
        if tail.iter().all(|s| s.is_valid() && self.is_critical(s)) {
            DegradationLevel::Critical
        } else if tail
            .iter()
            .all(|s| s.is_valid() && self.is_at_least_degraded(s))
        {
            DegradationLevel::Degraded
        } else {
            DegradationLevel::Normal
        }
    }

    /// Tx-power deltas for (source, destination) from the latest sample.
    fn power_adjustment(&self, sample: Option<&QotSample>) -> (f64, f64) {
        let mut delta = 0.0;
        if let Some(sample) = sample {
            if let Some(osnr) = sample.osnr {
                if osnr < self.osnr_threshold {
                    delta = self.tx_step;
                } else if osnr > self.osnr_threshold + 3.0 {
                    // Comfortable margin: step power back down.
                    delta = -self.tx_step;
                }
            } else if sample.pre_fec_ber.is_some_and(|ber| ber > self.ber_threshold) {
                delta = self.tx_step;
            }
        }

        match self.adjust_mode {
            AdjustMode::Both => (delta, delta),
            AdjustMode::Source => (delta, 0.0),
            AdjustMode::Destination => (0.0, delta),
        }
    }

    fn clamp_power(&self, dbm: f64) -> f64 {
        dbm.clamp(self.tx_min, self.tx_max)
    }

    /// Ingests one telemetry report: appends the sample, re-evaluates
    /// degradation (skipped during cooldown), and triggers the
    /// correction path on a transition into DEGRADED/CRITICAL.
    #[instrument(skip(self, report), fields(conn = %report.connection_id))]
    pub async fn ingest(&self, report: TelemetryReport) {
        let conn_id = report.connection_id.clone();
        let entry = self.state(&conn_id);

        let escalation = {
            let mut state = entry.lock().await;
            state.push(report.sample);

            if state.in_cooldown() {
                debug!("in cooldown, skipping evaluation");
                None
            } else {
                let tail = state.tail(self.persistency);
                let new_level = self.classify(&tail);
                if new_level == state.level {
                    None
                } else {
                    let old = state.level;
                    state.level = new_level;
                    if matches!(
                        new_level,
                        DegradationLevel::Degraded | DegradationLevel::Critical
                    ) {
                        state.last_degradation = Some(Instant::now());
                        warn!(
                            ?old,
                            ?new_level,
                            osnr = ?report.sample.osnr,
                            pre_fec_ber = ?report.sample.pre_fec_ber,
                            "connection degraded"
                        );
                        Some(report.sample)
                    } else {
                        info!(?old, ?new_level, "connection recovered");
                        None
                    }
                }
            }
        };

        // The monitor lock is released before any manager call.
        if let Some(sample) = escalation {
            match self.manager.mark_degraded(&conn_id, Some(sample)).await {
                Ok(true) => self.attempt_reconfiguration(&conn_id, &entry).await,
                Ok(false) => debug!("connection not in a degradable state"),
                Err(e) => warn!(error = %e, "failed to mark connection degraded"),
            }
        }
    }

    /// Bounded correction: at most `max_reconfig_attempts` cycles per
    /// connection, never inside the cooldown window, and only when the
    /// FSM admits a reconfiguration. Commands go out through the bus;
    /// only a confirmed send counts as a completed cycle.
    async fn attempt_reconfiguration(&self, conn_id: &ConnectionId, entry: &Arc<Mutex<QotState>>) {
        let (latest, source_dbm, destination_dbm) = {
            let state = entry.lock().await;
            if state.reconfig_count >= self.max_reconfig_attempts {
                warn!(conn = %conn_id, "max reconfiguration attempts reached");
                return;
            }
            if state.in_cooldown() {
                debug!(conn = %conn_id, "in cooldown, not reconfiguring");
                return;
            }
            (
                state.samples.back().copied(),
                state.source_tx_dbm,
                state.destination_tx_dbm,
            )
        };

        if let Err(e) = self
            .manager
            .start_reconfiguration(conn_id, ReconfigReason::QotDegradation.as_str())
            .await
        {
            debug!(conn = %conn_id, error = %e, "reconfiguration not started");
            return;
        }

        let (source_delta, destination_delta) = self.power_adjustment(latest.as_ref());
        let new_source = self.clamp_power(source_dbm + source_delta);
        let new_destination = self.clamp_power(destination_dbm + destination_delta);

        let Some(conn) = self.manager.get_connection(conn_id).await else {
            error!(conn = %conn_id, "connection vanished during reconfiguration");
            return;
        };

        match self
            .dispatcher
            .dispatch_reconfig(
                &conn,
                ReconfigReason::QotDegradation,
                new_source,
                new_destination,
            )
            .await
        {
            Ok(()) => {
                {
                    let mut state = entry.lock().await;
                    state.reconfig_count += 1;
                    state.last_reconfig = Some(Instant::now());
                    state.last_reconfig_unix = Some(unix_now());
                    state.cooldown_until = Some(Instant::now() + self.cooldown);
                    state.source_tx_dbm = new_source;
                    state.destination_tx_dbm = new_destination;
                }
                if let Err(e) = self.manager.complete_reconfiguration(conn_id).await {
                    warn!(conn = %conn_id, error = %e, "could not complete reconfiguration");
                }
                info!(
                    conn = %conn_id,
                    source_tx = new_source,
                    destination_tx = new_destination,
                    "reconfiguration applied"
                );
            }
            Err(e) => {
                // Stay DEGRADED; the sweep or the operator takes over.
                error!(conn = %conn_id, error = %e, "reconfiguration dispatch failed");
                if let Err(e) = self.manager.fail_reconfiguration(conn_id).await {
                    warn!(conn = %conn_id, error = %e, "could not record reconfiguration failure");
                }
            }
        }
    }

    /// One pass of the recovery sweep: a DEGRADED/CRITICAL connection
    /// whose last N samples are all back within thresholds returns to
    /// NORMAL without any commands.
    pub async fn recovery_pass(&self) {
        let entries: Vec<(ConnectionId, Arc<Mutex<QotState>>)> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        for (conn_id, entry) in entries {
            let mut state = entry.lock().await;
            if !matches!(
                state.level,
                DegradationLevel::Degraded | DegradationLevel::Critical
            ) || state.in_cooldown()
            {
                continue;
            }
            let tail = state.tail(self.persistency);
            if tail.len() >= self.persistency
                && tail.iter().all(|s| self.within_thresholds(s))
            {
                state.level = DegradationLevel::Normal;
                info!(conn = %conn_id, "connection automatically recovered");
            }
        }
    }

    /// Spawns the periodic recovery sweep task.
    pub fn spawn_recovery_sweep(
        self: &Arc<Self>,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => monitor.recovery_pass().await,
                }
            }
        })
    }

    /// Drops monitor state for a connection that no longer exists.
    pub fn forget(&self, id: &ConnectionId) {
        self.states.remove(id);
    }

    /// QoT status of one monitored connection.
    pub async fn qot_status(&self, id: &ConnectionId) -> Option<QotStatus> {
        let entry = self.states.get(id).map(|e| Arc::clone(e.value()))?;
        let state = entry.lock().await;
        Some(QotStatus {
            connection_id: id.clone(),
            degradation_level: state.level,
            reconfig_count: state.reconfig_count,
            in_cooldown: state.in_cooldown(),
            last_reconfig_time: state.last_reconfig_unix,
            recent_samples: state.tail(5),
        })
    }

    /// Fleet-wide summary.
    pub async fn overview(&self) -> QotOverview {
        let entries: Vec<Arc<Mutex<QotState>>> =
            self.states.iter().map(|e| Arc::clone(e.value())).collect();
        let mut degraded = 0;
        let mut critical = 0;
        for entry in &entries {
            let state = entry.lock().await;
            match state.level {
                DegradationLevel::Degraded => degraded += 1,
                DegradationLevel::Critical => critical += 1,
                _ => {}
            }
        }
        QotOverview {
            total_monitored: entries.len(),
            degraded_connections: degraded,
            critical_connections: critical,
            timestamp: unix_now(),
        }
    }
}

//! Bus client: keyed command producer and monitoring consumer.
//!
//! One producer path with synchronous confirmation, bounded retries
//! with exponential backoff, and a single send in flight at a time so
//! per-agent ordering survives retries. One background consumer loop
//! polls the monitoring topic and fans records out to registered
//! heartbeat/telemetry/ack callbacks; a failing callback is logged and
//! never interrupts polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use super::commands::Command;
use super::messages::{parse_monitoring, CommandAck, HeartbeatEvent, MonitoringEvent, TelemetryReport};
use super::transport::{BusTransport, Record};
use super::BusError;
use crate::config::ControllerConfig;

/// Async callback invoked for every heartbeat on the monitoring topic.
pub type HeartbeatCallback = Arc<dyn Fn(HeartbeatEvent) -> BoxFuture<'static, ()> + Send + Sync>;
/// Async callback invoked for every telemetry report.
pub type TelemetryCallback = Arc<dyn Fn(TelemetryReport) -> BoxFuture<'static, ()> + Send + Sync>;
/// Async callback invoked for every command acknowledgement.
pub type AckCallback = Arc<dyn Fn(CommandAck) -> BoxFuture<'static, ()> + Send + Sync>;

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_POLL_RECORDS: usize = 100;

#[derive(Default)]
struct Callbacks {
    heartbeat: RwLock<Vec<HeartbeatCallback>>,
    telemetry: RwLock<Vec<TelemetryCallback>>,
    ack: RwLock<Vec<AckCallback>>,
}

/// Producer/consumer pair over the tenant's two topics.
pub struct BusClient {
    transport: Arc<dyn BusTransport>,
    config_topic: String,
    monitoring_topic: String,
    send_timeout: Duration,
    send_retries: u32,
    poll_interval: Duration,
    shutdown_grace: Duration,
    /// Serializes producers: at most one send in flight.
    send_gate: Mutex<()>,
    callbacks: Arc<Callbacks>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    malformed: Arc<AtomicU64>,
}

impl BusClient {
    #[must_use]
    pub fn new(transport: Arc<dyn BusTransport>, config: &ControllerConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        info!(
            config_topic = %config.config_topic,
            monitoring_topic = %config.monitoring_topic,
            "bus client initialized for {}",
            config.virtual_operator
        );
        Self {
            transport,
            config_topic: config.config_topic.clone(),
            monitoring_topic: config.monitoring_topic.clone(),
            send_timeout: config.send_timeout,
            send_retries: config.send_retries,
            poll_interval: config.consumer_poll_interval,
            shutdown_grace: config.shutdown_grace,
            send_gate: Mutex::new(()),
            callbacks: Arc::new(Callbacks::default()),
            consumer: Mutex::new(None),
            stop_tx,
            malformed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn register_heartbeat_callback(&self, cb: HeartbeatCallback) {
        self.callbacks
            .heartbeat
            .write()
            .expect("callback lock poisoned")
            .push(cb);
    }

    pub fn register_telemetry_callback(&self, cb: TelemetryCallback) {
        self.callbacks
            .telemetry
            .write()
            .expect("callback lock poisoned")
            .push(cb);
    }

    pub fn register_ack_callback(&self, cb: AckCallback) {
        self.callbacks
            .ack
            .write()
            .expect("callback lock poisoned")
            .push(cb);
    }

    /// Records rejected by the monitoring parser so far.
    #[must_use]
    pub fn malformed_records(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Publishes a command on the config topic, keyed by its target
    /// agent, blocking the caller until the broker confirms.
    #[instrument(skip(self, command))]
    pub async fn send_command<C: Command>(&self, command: &C) -> Result<(), BusError> {
        let value = serde_json::to_value(command)
            .map_err(|e| BusError::Transport(format!("command serialization failed: {e}")))?;
        let key = command.key().map(ToString::to_string);
        self.send(self.config_topic.clone(), key, value).await
    }

    async fn send(
        &self,
        topic: String,
        key: Option<String>,
        value: serde_json::Value,
    ) -> Result<(), BusError> {
        let _gate = self.send_gate.lock().await;

        let mut backoff = INITIAL_RETRY_BACKOFF;
        let mut last_err = BusError::Unavailable("send was never attempted".to_string());

        for attempt in 0..=self.send_retries {
            let record = Record {
                topic: topic.clone(),
                key: key.clone(),
                value: value.clone(),
            };
            match timeout(self.send_timeout, self.transport.send(record)).await {
                Ok(Ok(())) => {
                    debug!(topic = %topic, ?key, attempt, "send confirmed");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(topic = %topic, attempt, error = %e, "send failed");
                    last_err = e;
                }
                Err(_) => {
                    warn!(topic = %topic, attempt, "send confirmation timed out");
                    last_err = BusError::SendTimeout {
                        topic: topic.clone(),
                        timeout: self.send_timeout,
                    };
                }
            }
            if attempt < self.send_retries {
                sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_err)
    }

    /// Starts the background consumer loop over the monitoring topic.
    /// A second call while the loop is running is a no-op.
    pub async fn start_consumer(self: &Arc<Self>) {
        let mut guard = self.consumer.lock().await;
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let _ = self.stop_tx.send(false);
        let client = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            info!(topic = %client.monitoring_topic, "consumer loop started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    polled = client.transport.poll(
                        &client.monitoring_topic,
                        MAX_POLL_RECORDS,
                        client.poll_interval,
                    ) => match polled {
                        Ok(records) => {
                            for record in records {
                                client.route_monitoring(&record.value).await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "consumer poll failed");
                            sleep(client.poll_interval).await;
                        }
                    }
                }
            }
            info!("consumer loop stopped");
        });
        *guard = Some(handle);
    }

    /// Stops the consumer loop, waiting up to the shutdown grace period
    /// before aborting it.
    pub async fn stop_consumer(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.consumer.lock().await.take();
        if let Some(mut handle) = handle {
            if timeout(self.shutdown_grace, &mut handle).await.is_err() {
                warn!("consumer did not stop in time, aborting");
                handle.abort();
            }
        }
    }

    async fn route_monitoring(&self, value: &serde_json::Value) {
        match parse_monitoring(value) {
            MonitoringEvent::Heartbeat(event) => {
                let callbacks: Vec<HeartbeatCallback> = self
                    .callbacks
                    .heartbeat
                    .read()
                    .expect("callback lock poisoned")
                    .clone();
                for cb in callbacks {
                    cb(event.clone()).await;
                }
            }
            MonitoringEvent::Telemetry(report) => {
                let callbacks: Vec<TelemetryCallback> = self
                    .callbacks
                    .telemetry
                    .read()
                    .expect("callback lock poisoned")
                    .clone();
                for cb in callbacks {
                    cb(report.clone()).await;
                }
            }
            MonitoringEvent::Ack(ack) => {
                let callbacks: Vec<AckCallback> = self
                    .callbacks
                    .ack
                    .read()
                    .expect("callback lock poisoned")
                    .clone();
                for cb in callbacks {
                    cb(ack.clone()).await;
                }
            }
            MonitoringEvent::Ignored => {}
            MonitoringEvent::Malformed { reason } => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(%reason, "malformed monitoring record");
            }
        }
    }
}

//! Long-lived broker session
//!
//! [`MqttSession`] owns the rumqttc client and a supervisor task that drives
//! the event loop. The supervisor tracks connection state, binds outgoing
//! publishes to their QoS 2 acknowledgements and keeps polling through
//! connection errors (rumqttc reconnects on the next poll).
//!
//! A connection error settles every outstanding publish and empties rumqttc's
//! replay queue. Sessions use clean start, so the broker has no use for the
//! old packet ids, and the publisher's retry loop re-sends what it still wants
//! delivered.

use super::ack_tracker::AckTracker;
use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::publisher::Session;
use crate::config::MqttServerSection;
use crate::error::PublishError;
use crate::message::OutboundMessage;
use crate::observability::MetricsCollector;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, Request};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 1024;

type SharedTracker = Arc<Mutex<AckTracker>>;

pub struct MqttSession {
    client: AsyncClient,
    tracker: SharedTracker,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    broker: String,
}

impl MqttSession {
    /// Build the session and spawn its supervisor; does not wait for the broker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &MqttServerSection,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self, MqttError> {
        let options = configure_mqtt_options(config)?;
        let broker = format!("{}:{}", config.host, config.port);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let tracker: SharedTracker = Arc::new(Mutex::new(AckTracker::new()));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(broker = %broker, tls = config.usetls, "Starting MQTT session");

        let supervisor = Supervisor {
            tracker: Arc::clone(&tracker),
            state_tx,
            shutdown_rx,
            metrics,
            reconnect: ReconnectConfig::default(),
            broker: broker.clone(),
        };
        let handle = tokio::spawn(supervisor.run(event_loop));

        Ok(Self {
            client,
            tracker,
            state_rx,
            shutdown_tx,
            supervisor: Mutex::new(Some(handle)),
            broker,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    /// Wait until the broker acknowledges the connection
    ///
    /// Connection errors before the deadline are not fatal; the supervisor
    /// keeps retrying until `timeout` elapses.
    pub async fn wait_for_connection(&self, timeout: Duration) -> Result<(), MqttError> {
        let mut state_rx = self.state_rx.clone();
        let waited = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| {
                matches!(state, ConnectionState::Connected | ConnectionState::Closed)
            }),
        )
        .await;

        match waited {
            Ok(Ok(state)) if *state == ConnectionState::Connected => Ok(()),
            Ok(_) => Err(MqttError::Closed),
            Err(_) => {
                warn!(
                    broker = %self.broker,
                    state = %self.state(),
                    "No ConnAck before deadline"
                );
                Err(MqttError::ConnectionTimeout { after: timeout })
            }
        }
    }

    /// Stop the supervisor and tell the broker we are leaving
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!(broker = %self.broker, "MQTT session closed"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT supervisor ended with error: {}", e),
                Ok(Err(_)) => {}
                Err(_) => warn!("MQTT supervisor did not stop in time"),
            }
        }
        Ok(())
    }

    fn lock_tracker(&self) -> MutexGuard<'_, AckTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Session for MqttSession {
    async fn publish_once(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        // State check, registration and enqueue happen under the tracker lock
        // so the queue order matches the client's request order and nothing is
        // queued while the supervisor is settling a lost connection.
        let ack = {
            let mut tracker = self.lock_tracker();
            let state = self.state();
            if !state.can_publish() {
                return Err(PublishError::not_connected(state.to_string()));
            }
            let ack = tracker.register();
            if let Err(e) = self.client.try_publish(
                message.topic.clone(),
                message.qos.into(),
                message.retained,
                message.payload.clone(),
            ) {
                tracker.cancel_last();
                return Err(PublishError::transport(e));
            }
            ack
        };

        ack.await
            .map_err(|_| PublishError::transport("MQTT session closed before acknowledgement"))?
    }

    fn is_connected(&self) -> bool {
        self.state_rx.borrow().can_publish()
    }

    async fn close(&self) {
        if let Err(e) = self.disconnect().await {
            warn!("MQTT disconnect failed: {}", e);
        }
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self
            .supervisor
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Event loop driver running on its own task
struct Supervisor {
    tracker: SharedTracker,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<MetricsCollector>,
    reconnect: ReconnectConfig,
    broker: String,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }

                polled = event_loop.poll() => match polled {
                    Ok(event) => {
                        self.handle_event(&event);
                        if matches!(event, Event::Incoming(Packet::ConnAck(_))) {
                            consecutive_failures = 0;
                        }
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        self.handle_connection_error(&mut event_loop, &e, consecutive_failures);

                        let delay = self.reconnect.calculate_backoff_delay(consecutive_failures);
                        if !self.interruptible_sleep(delay).await {
                            break;
                        }
                    }
                }
            }
        }

        self.lock_tracker().fail_all("MQTT session closed");
        self.metrics.mqtt_connection_lost();
        let _ = self.state_tx.send(ConnectionState::Closed);
        info!(broker = %self.broker, "MQTT supervisor stopped");
    }

    fn handle_event(&self, event: &Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!(broker = %self.broker, "Connected to MQTT broker");
                self.metrics.mqtt_connection_established();
                let _ = self.state_tx.send(ConnectionState::Connected);
            }
            Event::Incoming(Packet::Disconnect(disconnect)) => {
                warn!(reason = ?disconnect.reason_code, "Broker sent DISCONNECT");
            }
            _ => {}
        }

        self.lock_tracker().handle_event(event);
    }

    fn handle_connection_error(
        &self,
        event_loop: &mut EventLoop,
        error: &ConnectionError,
        consecutive_failures: u32,
    ) {
        let reason = error.to_string();
        let was_connected = self.state_tx.borrow().can_publish();
        if was_connected {
            error!(broker = %self.broker, error = %reason, "MQTT connection lost");
        } else {
            debug!(
                broker = %self.broker,
                error = %reason,
                attempt = consecutive_failures,
                "MQTT connection attempt failed"
            );
        }

        self.metrics.mqtt_connection_lost();

        let mut tracker = self.lock_tracker();
        // Events buffered before the failure still belong to this connection
        while let Some(event) = event_loop.state.events.pop_front() {
            tracker.handle_event(&event);
        }
        // Pull in requests queued on the channel since rumqttc's own cleanup
        event_loop.clean();
        tracker.connection_lost(error, &event_loop.pending);

        let discarded = discard_previous_session(event_loop);
        if discarded > 0 {
            debug!(discarded, "Dropped requests queued for replay");
        }
        let _ = self.state_tx.send(ConnectionState::Disconnected(reason));
    }

    /// Returns false if shutdown was requested during the delay
    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            changed = self.shutdown_rx.changed() => {
                changed.is_ok() && !*self.shutdown_rx.borrow()
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn lock_tracker(&self) -> MutexGuard<'_, AckTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drop the publishes and releases rumqttc would replay on the next connection
fn discard_previous_session(event_loop: &mut EventLoop) -> usize {
    let before = event_loop.pending.len();
    event_loop
        .pending
        .retain(|request| !matches!(request, Request::Publish(_) | Request::PubRel(_)));
    event_loop.state.collision = None;
    event_loop.state.events.clear();
    before - event_loop.pending.len()
}

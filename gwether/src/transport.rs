//! MQTT transport and ingestion lifecycle.
//!
//! A [`Transport`] walks through the states of [`LifecycleState`]:
//!
//! ```text
//! Connecting -> Subscribed -> Running -> Draining -> Disconnected
//! ```
//!
//! Connection and subscription failures are fatal and returned to the caller;
//! nothing is retried during startup. Once running, the network loop feeds a
//! [`DeliveryPool`] until the shutdown channel fires, then disconnects within
//! a fixed grace window and lets queued deliveries finish.
//!
//! Messages are consumed at QoS 0 (at most once): a reading that fails to
//! decode or write is lost.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rumqttc::{Client, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};

use crate::delivery::{DeliveryPool, DeliverySender};
use crate::dispatch::MessageHandler;
use crate::error::{Result, TransportError};

/// Broker used when none is configured.
pub const DEFAULT_BROKER: &str = "tcp://localhost:1883";

/// Topic `rtl_433` publishes decoded events on.
pub const DEFAULT_TOPIC: &str = "rtl_433/cubieboard/events";

/// Client identifier presented to the broker.
pub const DEFAULT_CLIENT_ID: &str = "rrd-writer";

/// How long a disconnect may take before in-flight work is abandoned.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Default MQTT port.
const DEFAULT_PORT: u16 = 1883;

/// Capacity of the client request queue.
const REQUEST_CAPACITY: usize = 64;

/// Pause between reconnection attempts after the connection drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// Broker address, e.g. `tcp://localhost:1883`.
    pub broker: String,
    /// Client identifier.
    pub client_id: String,
    /// Optional user name; the password is only sent with a user name.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Topic filter to subscribe to.
    pub topic: String,
    /// Number of delivery threads.
    pub workers: usize,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Disconnect grace window.
    pub grace: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: DEFAULT_BROKER.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            username: None,
            password: None,
            topic: DEFAULT_TOPIC.to_string(),
            workers: 1,
            keep_alive: Duration::from_secs(30),
            grace: DISCONNECT_GRACE,
        }
    }
}

/// Where a [`Transport`] is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Waiting for the broker to acknowledge the connection.
    Connecting,
    /// Connected; the subscription is being registered.
    Subscribed,
    /// Subscription acknowledged; messages are being delivered.
    Running,
    /// Shutdown requested; disconnecting and finishing in-flight messages.
    Draining,
    /// Disconnected from the broker.
    Disconnected,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Splits a broker address into host and port.
///
/// Accepts `host`, `host:port`, and either form prefixed with `tcp://` or
/// `mqtt://`. The port defaults to 1883.
///
/// # Errors
///
/// Returns [`TransportError::InvalidBroker`] for other schemes, an empty host,
/// or an invalid port.
pub fn parse_broker(address: &str) -> Result<(String, u16)> {
    let invalid = |reason: &str| TransportError::InvalidBroker {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let rest = match address.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme '{scheme}'")).into()),
        None => address,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
            (host, port)
        }
        None => (rest, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(invalid("missing host").into());
    }
    if port == 0 {
        return Err(invalid("port must be non-zero").into());
    }

    Ok((host.to_string(), port))
}

/// A connection to the broker driving ingestion.
pub struct Transport {
    config: MqttConfig,
    client: Client,
    connection: Connection,
    state: LifecycleState,
    /// Publishes that arrived before the subscription was acknowledged.
    early: Vec<Vec<u8>>,
}

impl Transport {
    /// Connects to the broker and waits for its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidBroker`] for a bad address and
    /// [`TransportError::Connect`] if the connection fails or is refused.
    pub fn connect(config: MqttConfig) -> Result<Self> {
        let (host, port) = parse_broker(&config.broker)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        tracing::info!(broker = %config.broker, state = %LifecycleState::Connecting, "connecting to MQTT broker");

        let connect_err = |reason: String| TransportError::Connect {
            broker: config.broker.clone(),
            reason,
        };

        loop {
            match next_event(&mut connection) {
                Some(Ok(Event::Incoming(Packet::ConnAck(_)))) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(connect_err(e.to_string()).into()),
                None => return Err(connect_err("connection closed".to_string()).into()),
            }
        }

        let transport = Self {
            config,
            client,
            connection,
            state: LifecycleState::Subscribed,
            early: Vec::new(),
        };
        tracing::info!(state = %transport.state, "connected to MQTT broker");
        Ok(transport)
    }

    /// Subscribes to the configured topic at QoS 0 and waits for the broker
    /// to acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Subscribe`] if the broker rejects the filter
    /// or the connection fails before acknowledging it.
    pub fn subscribe(&mut self) -> Result<()> {
        let topic = self.config.topic.clone();
        let subscribe_err = |reason: String| TransportError::Subscribe {
            topic: topic.clone(),
            reason,
        };

        tracing::debug!(topic = %topic, "subscribing");
        self.client
            .subscribe(topic.as_str(), QoS::AtMostOnce)
            .map_err(TransportError::from)?;

        loop {
            match next_event(&mut self.connection) {
                Some(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(subscribe_err("rejected by broker".to_string()).into());
                    }
                    break;
                }
                Some(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    self.early.push(publish.payload.to_vec());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(subscribe_err(e.to_string()).into()),
                None => return Err(subscribe_err("connection closed".to_string()).into()),
            }
        }

        self.state = LifecycleState::Running;
        tracing::info!(topic = %topic, state = %self.state, "subscribed");
        Ok(())
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Delivers messages to `handler` until `shutdown` receives a value (or
    /// its sender is dropped), then disconnects.
    ///
    /// After the shutdown signal the broker connection is closed. If the
    /// network loop stops within the grace window, queued messages are
    /// handled before this returns; otherwise they are abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Thread`] if the network or delivery threads
    /// cannot be spawned.
    pub fn run<H>(mut self, handler: Arc<H>, shutdown: &Receiver<()>) -> Result<()>
    where
        H: MessageHandler + ?Sized + 'static,
    {
        let pool = DeliveryPool::start(handler, self.config.workers).map_err(|source| {
            TransportError::Thread {
                name: "delivery".to_string(),
                source,
            }
        })?;
        let sender = pool.sender();
        for payload in self.early.drain(..) {
            sender.deliver(payload);
        }

        let stopping = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let mut connection = self.connection;
        let client = self.client.clone();
        let topic = self.config.topic.clone();
        let loop_stopping = Arc::clone(&stopping);
        let network = thread::Builder::new()
            .name("mqtt-network".to_string())
            .spawn(move || {
                network_loop(&mut connection, &client, &topic, &sender, &loop_stopping);
                let _ = done_tx.send(());
            })
            .map_err(|source| TransportError::Thread {
                name: "network".to_string(),
                source,
            })?;

        tracing::info!(workers = pool.worker_count(), state = %self.state, "ingesting");

        if shutdown.recv().is_err() {
            tracing::warn!("shutdown channel closed");
        }

        self.state = LifecycleState::Draining;
        tracing::info!(state = %self.state, "shutting down gracefully");
        stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect() {
            tracing::warn!("disconnect request failed: {e}");
        }

        match done_rx.recv_timeout(self.config.grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if network.join().is_err() {
                    tracing::error!("network thread panicked");
                }
                pool.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    grace = ?self.config.grace,
                    "network loop did not stop in time, abandoning queued messages"
                );
            }
        }

        self.state = LifecycleState::Disconnected;
        tracing::info!(state = %self.state, "disconnected");
        Ok(())
    }
}

fn next_event(connection: &mut Connection) -> Option<std::result::Result<Event, ConnectionError>> {
    connection.iter().next()
}

/// Forwards publishes to the delivery pool until disconnected.
fn network_loop(
    connection: &mut Connection,
    client: &Client,
    topic: &str,
    sender: &DeliverySender,
    stopping: &AtomicBool,
) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if !sender.deliver(publish.payload.to_vec()) {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // A clean session after reconnecting has lost the subscription.
                tracing::info!("reconnected to MQTT broker, resubscribing");
                if let Err(e) = client.try_subscribe(topic, QoS::AtMostOnce) {
                    tracing::warn!("resubscribe failed: {e}");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!("MQTT connection error: {e}");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
}

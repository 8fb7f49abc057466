//! MQTT trigger
//!
//! Subscribes to every source topic and turns each publish into an
//! insert-and-forward on the matching source. Malformed payloads are logged
//! and dropped; they were never accepted, so there is nothing to retry.
//!
//! A payload is one instance object (`{"a": 5, "b": "x"}`) or an array of
//! them.
//!
//! The event loop only hands messages over. Persisting happens in one
//! routing task per topic, so keep-alives keep flowing while the database is
//! slow and messages on a topic are still stored in arrival order.

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttSettings;
use crate::error::{Error, Result};
use crate::field::Instance;
use crate::ingest::IngestPipeline;

/// What happened to one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Rows were persisted and queued
    Accepted {
        /// Number of rows accepted
        rows: usize,
    },
    /// No source listens on the topic
    UnknownTopic,
    /// The payload could not be decoded
    Malformed(String),
}

/// Routes messages from topics to sources
#[derive(Clone)]
pub struct TopicRouter {
    pipeline: Arc<IngestPipeline>,
}

impl TopicRouter {
    /// Create a router feeding `pipeline`
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self { pipeline }
    }

    /// Topics to subscribe to
    pub fn topics(&self) -> Vec<String> {
        self.pipeline.registry().topics()
    }

    /// Decode `payload` and push it to the source listening on `topic`.
    ///
    /// Decoding problems are reported as [`RouteOutcome::Malformed`], not as
    /// errors. Persistence failures are errors.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> Result<RouteOutcome> {
        let Some(source) = self.pipeline.registry().by_topic(topic) else {
            warn!(topic = %topic, "message on unrouted topic dropped");
            return Ok(RouteOutcome::UnknownTopic);
        };

        let instances = match decode_payload(source.fields(), payload) {
            Ok(instances) => instances,
            Err(e) => {
                warn!(
                    topic = %topic,
                    source = %source.public_key(),
                    bytes = payload.len(),
                    error = %e,
                    "malformed payload dropped"
                );
                return Ok(RouteOutcome::Malformed(e.to_string()));
            }
        };

        let rows = self.pipeline.push_instances(&source, instances).await?;
        debug!(topic = %topic, source = %source.public_key(), rows, "message accepted");
        Ok(RouteOutcome::Accepted { rows })
    }
}

fn decode_payload(fields: &[crate::field::Field], payload: &[u8]) -> Result<Vec<Instance>> {
    let objects = match serde_json::from_slice::<serde_json::Value>(payload)? {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    objects
        .iter()
        .map(|o| {
            Instance::from_wire(fields, o)
                .ok_or_else(|| Error::InvalidInstance("expected a JSON object".into()))
        })
        .collect()
}

/// Messages waiting per topic before new ones are dropped
pub const LANE_CAPACITY: usize = 1000;

/// Hands inbound messages to per-topic routing tasks
pub struct MessageDispatcher {
    lanes: HashMap<String, mpsc::Sender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MessageDispatcher {
    /// Start one routing task for every topic `router` knows
    pub fn start(router: TopicRouter) -> Self {
        let mut lanes = HashMap::new();
        let mut tasks = Vec::new();
        for topic in router.topics() {
            let (tx, rx) = mpsc::channel(LANE_CAPACITY);
            tasks.push(tokio::spawn(route_lane(router.clone(), topic.clone(), rx)));
            lanes.insert(topic, tx);
        }
        Self { lanes, tasks }
    }

    /// Queue `payload` without waiting. Returns `false` if the message was
    /// dropped: nobody listens on `topic`, or its lane is full.
    pub fn dispatch(&self, topic: &str, payload: Vec<u8>) -> bool {
        let Some(lane) = self.lanes.get(topic) else {
            warn!(topic = %topic, "message on unrouted topic dropped");
            return false;
        };
        match lane.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(payload)) => {
                warn!(
                    topic = %topic,
                    bytes = payload.len(),
                    capacity = LANE_CAPACITY,
                    "routing lane full, message dropped"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Stop taking messages and wait until every queued one is routed
    pub async fn drain(mut self) {
        self.lanes.clear();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "MQTT routing task panicked");
            }
        }
    }
}

async fn route_lane(router: TopicRouter, topic: String, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(payload) = rx.recv().await {
        if let Err(e) = router.route(&topic, &payload).await {
            error!(
                topic = %topic,
                retriable = e.is_retriable(),
                error = %e,
                "failed to ingest message"
            );
        }
    }
    debug!(topic = %topic, "routing lane closed");
}

/// Parse a broker URL into host, port and TLS flag.
///
/// Accepts `mqtt://`, `mqtts://`, `tcp://`, `ssl://` and `tls://`; a URL
/// without a scheme is plain MQTT. Ports default to 1883 or 8883.
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool)> {
    let (scheme, rest) = match url.find("://") {
        Some(pos) => (&url[..pos], &url[pos + 3..]),
        None => ("mqtt", url),
    };

    let use_tls = match scheme.to_ascii_lowercase().as_str() {
        "mqtts" | "ssl" | "tls" => true,
        "mqtt" | "tcp" => false,
        other => {
            return Err(Error::config(format!("unsupported broker scheme '{}'", other)));
        }
    };

    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rfind(':') {
        Some(colon) => {
            let port_str = &rest[colon + 1..];
            let port: u16 = port_str
                .parse()
                .map_err(|_| Error::config(format!("invalid port in broker URL: {}", port_str)))?;
            (&rest[..colon], port)
        }
        None => (rest, if use_tls { 8883 } else { 1883 }),
    };

    if host.is_empty() {
        return Err(Error::config(format!("broker URL '{}' has no host", url)));
    }

    Ok((host.to_string(), port, use_tls))
}

/// Build client options from settings
pub fn create_mqtt_options(settings: &MqttSettings) -> Result<MqttOptions> {
    let (host, port, use_tls) = parse_broker_url(&settings.broker_url)?;

    let mut options = MqttOptions::new(settings.client_id.clone(), host.clone(), port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    options.set_clean_session(true);

    if let Some(username) = &settings.username {
        let password = settings
            .password
            .as_ref()
            .map(|p| p.expose_secret().to_string())
            .unwrap_or_default();
        options.set_credentials(username.clone(), password);
    }

    if use_tls {
        options.set_transport(rumqttc::Transport::Tls(Default::default()));
        info!(host = %host, "MQTT TLS enabled");
    }

    Ok(options)
}

/// Long-running MQTT subscriber
pub struct MqttTrigger {
    settings: MqttSettings,
    router: TopicRouter,
    cancel: CancellationToken,
}

impl MqttTrigger {
    /// Create a trigger; it stops when `cancel` fires
    pub fn new(settings: MqttSettings, router: TopicRouter, cancel: CancellationToken) -> Self {
        Self {
            settings,
            router,
            cancel,
        }
    }

    /// Run the event loop until cancelled.
    ///
    /// Topics are (re)subscribed on every connection acknowledgement, so a
    /// broker restart does not lose subscriptions. Event-loop errors are
    /// followed by a fixed reconnect delay.
    pub async fn run(self) -> Result<()> {
        let topics = self.router.topics();
        if topics.is_empty() {
            info!("no source declares a topic, MQTT trigger idle");
            return Ok(());
        }

        let options = create_mqtt_options(&self.settings)?;
        let (client, mut eventloop) = AsyncClient::new(options, 10);
        let dispatcher = MessageDispatcher::start(self.router.clone());
        let reconnect_delay = Duration::from_millis(self.settings.reconnect_delay_ms);

        info!(
            broker = %self.settings.broker_url,
            client_id = %self.settings.client_id,
            topics = ?topics,
            "MQTT trigger starting"
        );

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(broker = %self.settings.broker_url, "MQTT connection acknowledged");
                    for topic in &topics {
                        match subscribe(&client, topic) {
                            Ok(()) => debug!(topic = %topic, "subscribed"),
                            Err(e) => error!(topic = %topic, error = %e, "failed to subscribe"),
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    dispatcher.dispatch(&publish.topic, publish.payload.to_vec());
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT broker disconnected, will reconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = self.settings.reconnect_delay_ms,
                        "MQTT connection error"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!(error = %e, "MQTT disconnect request not sent");
        }
        dispatcher.drain().await;
        info!("MQTT trigger stopped");
        Ok(())
    }
}

fn subscribe(client: &AsyncClient, topic: &str) -> Result<()> {
    client
        .try_subscribe(topic, QoS::AtLeastOnce)
        .map_err(|e| Error::Mqtt(format!("subscribe to '{}': {}", topic, e)))
}

//! MQTT bridge to courier devices
//!
//! Devices publish under `<prefix>/<delivery id>/`:
//! - `position`: a JSON fix
//! - `error`: `{"code": n}` with geolocation error codes
//! - `tracking`: `start` or `stop`
//!
//! While a delivery is watched, the gateway keeps its watch options retained
//! on `<prefix>/<delivery id>/watch` so the device samples accordingly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};

use crate::{
    config::MqttConfig,
    device::{FixRouter, PositionSource, PositionWatch, WatchOptions},
    errors::{DeviceError, TrackerError},
    models::{DeliveryId, Fix},
};

const CHANNEL_CAPACITY: usize = 100;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingCommand {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CourierMessage {
    Position(Fix),
    Error(DeviceError),
    Tracking(TrackingCommand),
}

/// Message received from a courier device
#[derive(Debug, Clone, PartialEq)]
pub struct CourierEvent {
    pub delivery_id: DeliveryId,
    pub message: CourierMessage,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    code: u8,
}

/// MQTT client builder for the courier bridge
pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    prefix: String,
}

/// Connected courier bridge
pub struct MqttClient {
    source: Arc<MqttPositionSource>,
    rx: mpsc::Receiver<(DeliveryId, TrackingCommand)>,
    _handle: tokio::task::JoinHandle<Result<(), TrackerError>>,
}

/// Position source backed by MQTT device messages
pub struct MqttPositionSource {
    client: AsyncClient,
    prefix: String,
    router: Arc<FixRouter>,
}

impl MqttClientBuilder {
    /// Create a new MQTT client
    pub fn new(config: &MqttConfig) -> Result<Self, TrackerError> {
        config.validate()?;

        let mut mqtt_options = if config.websocket {
            let url = format!("wss://{}:{}/mqtt", config.host, config.port);
            let mut options = MqttOptions::new(&config.client_id, url, config.port);
            options.set_transport(Transport::wss_with_default_config());
            options
        } else {
            MqttOptions::new(&config.client_id, &config.host, config.port)
        };
        mqtt_options.set_keep_alive(config.keep_alive);

        let (client, event_loop) = AsyncClient::new(mqtt_options, CHANNEL_CAPACITY);

        Ok(Self {
            client,
            event_loop,
            prefix: config.topic_prefix.clone(),
        })
    }

    /// Start the event loop
    ///
    /// Topic subscription happens in the event loop on every ConnAck.
    pub async fn connect(self) -> Result<MqttClient, TrackerError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let router = Arc::new(FixRouter::default());

        let _handle = tokio::spawn(Self::process_events(
            tx,
            self.event_loop,
            self.client.clone(),
            self.prefix.clone(),
            router.clone(),
        ));

        Ok(MqttClient {
            source: Arc::new(MqttPositionSource {
                client: self.client,
                prefix: self.prefix,
                router,
            }),
            rx,
            _handle,
        })
    }

    fn topics(prefix: &str) -> Vec<String> {
        ["position", "error", "tracking"]
            .iter()
            .map(|kind| format!("{}/+/{}", prefix, kind))
            .collect()
    }

    async fn subscribe(client: &AsyncClient, prefix: &str) -> Result<(), TrackerError> {
        for topic in Self::topics(prefix) {
            info!("Subscribing to topic: {}", topic);
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects by itself when the connection drops, but topic
    /// subscriptions have to be re-established, so they are made here.
    ///
    /// NOTE: If topic subscription fails, the loop will break and return an error.
    async fn process_events(
        tx: mpsc::Sender<(DeliveryId, TrackingCommand)>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        prefix: String,
        router: Arc<FixRouter>,
    ) -> Result<(), TrackerError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker, subscribing to topics");
                    if let Err(e) = Self::subscribe(&client, &prefix).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match Self::parse_message(&prefix, &publish.topic, &publish.payload) {
                        Ok(event) => Self::route(&tx, &router, event).await,
                        Err(e) => {
                            warn!("Failed to parse message on {}: {}", publish.topic, e);
                        }
                    }
                }
                Err(e) => {
                    error!("MQTT Error: {}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
                _ => continue,
            }
        }
    }

    async fn route(
        tx: &mpsc::Sender<(DeliveryId, TrackingCommand)>,
        router: &FixRouter,
        event: CourierEvent,
    ) {
        let CourierEvent {
            delivery_id,
            message,
        } = event;
        let delivered = match message {
            CourierMessage::Position(fix) => router.dispatch(&delivery_id, Ok(fix)),
            CourierMessage::Error(e) => router.dispatch(&delivery_id, Err(e)),
            CourierMessage::Tracking(command) => {
                if let Err(e) = tx.send((delivery_id.clone(), command)).await {
                    error!("Failed to send tracking command: {}", e);
                }
                true
            }
        };
        if !delivered {
            debug!("No active watch for {}, message dropped", delivery_id);
        }
    }

    /// Parse incoming message based on topic
    fn parse_message(
        prefix: &str,
        topic: &str,
        payload: &[u8],
    ) -> Result<CourierEvent, TrackerError> {
        let parts: Vec<&str> = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| TrackerError::InvalidTopic(topic.to_string()))?
            .split('/')
            .collect();

        // Validate topic structure
        if parts.len() != 2 {
            return Err(TrackerError::InvalidTopic(topic.to_string()));
        }

        let delivery_id = DeliveryId::try_from(parts[0])?;

        let message = match parts[1] {
            "position" => CourierMessage::Position(serde_json::from_slice(payload)?),
            "error" => {
                let ErrorPayload { code } = serde_json::from_slice(payload)?;
                let error = DeviceError::from_code(code)
                    .ok_or_else(|| TrackerError::UnknownMessageType(format!("error {}", code)))?;
                CourierMessage::Error(error)
            }
            "tracking" => {
                let command = String::from_utf8_lossy(payload).trim().to_ascii_lowercase();
                match command.as_str() {
                    "start" => CourierMessage::Tracking(TrackingCommand::Start),
                    "stop" => CourierMessage::Tracking(TrackingCommand::Stop),
                    _ => return Err(TrackerError::UnknownMessageType(command)),
                }
            }
            other => return Err(TrackerError::UnknownMessageType(other.to_string())),
        };

        Ok(CourierEvent {
            delivery_id,
            message,
        })
    }
}

impl MqttClient {
    /// Receive the next tracking command
    pub async fn recv(&mut self) -> Option<(DeliveryId, TrackingCommand)> {
        self.rx.recv().await
    }

    pub fn source(&self) -> Arc<MqttPositionSource> {
        self.source.clone()
    }
}

impl MqttPositionSource {
    fn watch_topic(&self, delivery_id: &DeliveryId) -> String {
        format!("{}/{}/watch", self.prefix, delivery_id)
    }

    /// An empty retained message clears the options
    fn clear_watch_options(client: &AsyncClient, topic: String) {
        if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, true, Vec::<u8>::new()) {
            warn!("Failed to clear watch options: {}", e);
        }
    }
}

#[async_trait]
impl PositionSource for MqttPositionSource {
    fn is_supported(&self) -> bool {
        true
    }

    async fn watch_position(
        &self,
        delivery_id: &DeliveryId,
        options: WatchOptions,
    ) -> Result<PositionWatch, TrackerError> {
        let topic = self.watch_topic(delivery_id);
        let payload = serde_json::to_vec(&options)?;
        self.client
            .publish(topic.clone(), QoS::AtLeastOnce, true, payload)
            .await?;

        let (key, raw) = self.router.register(delivery_id);
        let router = self.router.clone();
        let client = self.client.clone();
        let delivery_id = delivery_id.clone();
        Ok(PositionWatch::spawn(raw, options).on_release(move || {
            if router.unregister(&delivery_id, key) {
                Self::clear_watch_options(&client, topic);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn parse(topic: &str, payload: &str) -> Result<CourierEvent, TrackerError> {
        MqttClientBuilder::parse_message("couriers", topic, payload.as_bytes())
    }

    #[test]
    fn parse_position_message() {
        let payload = r#"{
            "timestamp": 1668075025000,
            "coords": {
                "latitude": -15.7801,
                "longitude": -47.9292,
                "accuracy": 8.0,
                "speed": 10.0,
                "heading": 325.0
            }
        }"#;

        let event = parse("couriers/order-1/position", payload).unwrap();

        let expected = CourierEvent {
            delivery_id: DeliveryId::try_from("order-1").unwrap(),
            message: CourierMessage::Position(
                Fix::new(
                    DateTime::from_timestamp_millis(1668075025000).unwrap(),
                    -15.7801,
                    -47.9292,
                )
                .with_accuracy(8.0)
                .with_speed(10.0)
                .with_heading(325.0),
            ),
        };

        assert_eq!(event, expected);
    }

    #[test]
    fn parse_error_message() {
        let event = parse("couriers/order-1/error", r#"{"code": 1}"#).unwrap();
        assert_eq!(
            event.message,
            CourierMessage::Error(DeviceError::PermissionDenied)
        );
        assert!(parse("couriers/order-1/error", r#"{"code": 9}"#).is_err());
    }

    #[test]
    fn parse_tracking_commands() {
        let start = parse("couriers/order-1/tracking", "start").unwrap();
        assert_eq!(
            start.message,
            CourierMessage::Tracking(TrackingCommand::Start)
        );
        let stop = parse("couriers/order-1/tracking", " STOP\n").unwrap();
        assert_eq!(stop.message, CourierMessage::Tracking(TrackingCommand::Stop));
        assert!(parse("couriers/order-1/tracking", "pause").is_err());
    }

    #[test]
    fn reject_bad_topics() {
        assert!(matches!(
            parse("drivers/order-1/position", "{}"),
            Err(TrackerError::InvalidTopic(_))
        ));
        assert!(matches!(
            parse("couriers/order-1", "{}"),
            Err(TrackerError::InvalidTopic(_))
        ));
        assert!(matches!(
            parse("couriers/order-1/speed", "{}"),
            Err(TrackerError::UnknownMessageType(_))
        ));
        assert!(matches!(
            parse("couriersx/order-1/position", "{}"),
            Err(TrackerError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn one_shot_watch_leaves_session_watch_open() {
        let (client, _event_loop) =
            AsyncClient::new(MqttOptions::new("test", "localhost", 1883), CHANNEL_CAPACITY);
        let source = MqttPositionSource {
            client,
            prefix: "couriers".to_string(),
            router: Arc::new(FixRouter::default()),
        };
        let id = DeliveryId::try_from("order-1").unwrap();

        let mut session = source
            .watch_position(&id, WatchOptions::default())
            .await
            .unwrap();
        let one_shot = source
            .watch_position(&id, WatchOptions::default())
            .await
            .unwrap();
        drop(one_shot);

        assert!(source.router.is_watching(&id));
        let fix = Fix::new(chrono::Utc::now(), 1.0, 1.0);
        assert!(source.router.dispatch(&id, Ok(fix)));
        assert!(session.next().await.unwrap().is_ok());
    }

    #[test]
    fn subscription_topics() {
        assert_eq!(
            MqttClientBuilder::topics("couriers"),
            vec!["couriers/+/position", "couriers/+/error", "couriers/+/tracking"]
        );
    }
}

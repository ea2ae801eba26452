//! Application configuration

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::errors::TrackerError;
use crate::map::MapConfig;
use crate::models::Coordinates;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub viewer: Option<ViewerConfig>,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_keep_alive")]
    pub keep_alive: Duration,
    #[serde(default)]
    pub websocket: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Device sampling and write policy for tracking sessions
#[serde_as]
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TrackingConfig {
    pub high_accuracy: bool,
    /// Longest wait for a fix before a timeout is reported
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Fixes older than this are discarded
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub max_age: Duration,
    /// Attempts per write, 1 disables retrying
    pub write_attempts: u32,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub write_backoff: Duration,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            timeout: Duration::from_millis(10_000),
            max_age: Duration::from_millis(5_000),
            write_attempts: 1,
            write_backoff: Duration::from_millis(500),
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SubscriberConfig {
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub reconnect_initial: Duration,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub reconnect_max: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_millis(30_000),
        }
    }
}

/// Customer-side view of a single delivery
#[derive(Debug, Deserialize, Clone)]
pub struct ViewerConfig {
    pub delivery_id: String,
    pub customer: Option<Coordinates>,
    pub restaurant: Option<Coordinates>,
    pub restaurant_name: Option<String>,
    pub customer_address: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "couriers".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(5)
}

fn default_max_connections() -> u32 {
    5
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config/default"))
    }

    /// Load from an optional file, overridden by `DELIVERYTRACKER__*` variables
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("DELIVERYTRACKER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), TrackerError> {
        self.mqtt.validate()?;
        self.database.validate()?;
        self.tracking.validate()?;
        self.subscriber.validate()?;
        Ok(())
    }
}

fn invalid(message: &str) -> TrackerError {
    TrackerError::ConfigurationError {
        message: message.to_string(),
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.host.is_empty() {
            return Err(invalid("MQTT host cannot be empty"));
        }
        if self.client_id.is_empty() {
            return Err(invalid("MQTT client id cannot be empty"));
        }
        if self.topic_prefix.is_empty() || self.topic_prefix.contains(['+', '#']) {
            return Err(invalid("MQTT topic prefix must be a plain topic level"));
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.url.is_empty() {
            return Err(invalid("Database url cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(invalid("Database pool needs at least one connection"));
        }
        Ok(())
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.timeout.is_zero() {
            return Err(invalid("Tracking timeout must be greater than zero"));
        }
        if self.write_attempts == 0 {
            return Err(invalid("Write attempts must be at least one"));
        }
        Ok(())
    }
}

impl SubscriberConfig {
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.reconnect_initial.is_zero() || self.reconnect_max < self.reconnect_initial {
            return Err(invalid(
                "Reconnect backoff must be positive and not exceed its maximum",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [mqtt]
            host = "broker.local"
            client_id = "gateway-1"

            [database]
            url = "postgres://localhost/tracker"

            [tracking]
            timeout = 2000
            write_attempts = 3

            [viewer]
            delivery_id = "order-1"
            customer = {{ latitude = -15.79, longitude = -47.94 }}
            "#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "couriers");
        assert_eq!(config.mqtt.keep_alive, Duration::from_secs(5));
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.tracking.timeout, Duration::from_millis(2000));
        assert_eq!(config.tracking.max_age, Duration::from_millis(5000));
        assert_eq!(config.tracking.write_attempts, 3);
        assert!(config.tracking.high_accuracy);
        assert_eq!(config.subscriber, SubscriberConfig::default());

        let viewer = config.viewer.unwrap();
        assert_eq!(viewer.delivery_id, "order-1");
        assert_eq!(viewer.customer.unwrap().latitude, -15.79);
        assert!(viewer.restaurant.is_none());
    }

    #[test]
    fn test_tracking_defaults() {
        let tracking = TrackingConfig::default();
        assert!(tracking.high_accuracy);
        assert_eq!(tracking.timeout, Duration::from_millis(10_000));
        assert_eq!(tracking.max_age, Duration::from_millis(5_000));
        assert!(tracking.validate().is_ok());
    }

    #[test]
    fn test_tracking_config_validate_invalid_attempts() {
        let tracking = TrackingConfig {
            write_attempts: 0,
            ..TrackingConfig::default()
        };
        assert!(tracking.validate().is_err());
    }

    #[test]
    fn test_subscriber_config_validate_invalid_backoff() {
        let subscriber = SubscriberConfig {
            reconnect_initial: Duration::from_secs(10),
            reconnect_max: Duration::from_secs(1),
        };
        assert!(subscriber.validate().is_err());
    }

    #[test]
    fn test_mqtt_config_validate_wildcard_prefix() {
        let mqtt = MqttConfig {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "test".to_string(),
            topic_prefix: "couriers/#".to_string(),
            keep_alive: Duration::from_secs(5),
            websocket: false,
        };
        assert!(mqtt.validate().is_err());
    }

    #[test]
    fn test_database_config_validate() {
        let database = DatabaseConfig {
            url: String::new(),
            max_connections: 5,
        };
        assert!(database.validate().is_err());
    }
}

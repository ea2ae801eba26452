//! Errors for the delivery tracker
use thiserror::Error;

/// Fixed user-facing messages, in Brazilian Portuguese
pub mod messages {
    pub const LOAD_LOCATION: &str = "Erro ao carregar localização";
    pub const UPDATE_LOCATION: &str = "Erro ao atualizar localização";
    pub const GEOLOCATION_UNSUPPORTED: &str = "Geolocalização não suportada";
    pub const PERMISSION_DENIED: &str = "Permissão de localização negada";
    pub const POSITION_ERROR: &str = "Erro ao obter localização";
    pub const CONNECTION_LOST: &str = "Conexão perdida";
    pub const LOAD_MAP: &str = "Erro ao carregar mapa";
    pub const UNEXPECTED: &str = "Erro inesperado";
}

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("MQTT connection failed")]
    MqttConnectionError(#[from] rumqttc::ConnectionError),

    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Invalid topic")]
    InvalidTopic(String),

    #[error("Invalid delivery id")]
    InvalidDeliveryId(String),

    #[error("Invalid coordinates: lat={latitude}, lon={longitude}")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("Unknown message type")]
    UnknownMessageType(String),

    #[error("Store read failed: {0}")]
    StoreRead(String),

    #[error("Store write failed: {0}")]
    StoreWrite(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Geolocation not supported")]
    DeviceUnsupported,

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Map initialization failed: {0}")]
    MapInit(String),

    #[error("Database connection error: {0}")]
    DatabaseConnectionError(String),

    #[error("Database migration error")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),
}

impl TrackerError {
    /// Localized message to show the user for this error
    pub fn user_message(&self) -> &'static str {
        match self {
            TrackerError::StoreRead(_) => messages::LOAD_LOCATION,
            TrackerError::StoreWrite(_) | TrackerError::InvalidCoordinates { .. } => {
                messages::UPDATE_LOCATION
            }
            TrackerError::Subscription(_) => messages::CONNECTION_LOST,
            TrackerError::DeviceUnsupported => messages::GEOLOCATION_UNSUPPORTED,
            TrackerError::Device(e) => e.user_message(),
            TrackerError::MapInit(_) => messages::LOAD_MAP,
            _ => messages::UNEXPECTED,
        }
    }
}

/// Errors reported by a device location source
///
/// Codes follow the browser `GeolocationPositionError` numbering.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Position unavailable")]
    PositionUnavailable,

    #[error("Timed out waiting for a position fix")]
    Timeout,
}

impl DeviceError {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(DeviceError::PermissionDenied),
            2 => Some(DeviceError::PositionUnavailable),
            3 => Some(DeviceError::Timeout),
            _ => None,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            DeviceError::PermissionDenied => messages::PERMISSION_DENIED,
            DeviceError::PositionUnavailable | DeviceError::Timeout => messages::POSITION_ERROR,
        }
    }
}

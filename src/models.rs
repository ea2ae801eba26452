//! Data models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::TrackerError;
use serde_helpers::*;

/// Conversion factor from meters per second to kilometers per hour
pub const MPS_TO_KMH: f64 = 3.6;

/// Prefix of the per-delivery notification channel in the store
pub const CHANNEL_PREFIX: &str = "delivery_location:";

/// Longest accepted delivery id; keeps the channel name under 63 bytes
const MAX_DELIVERY_ID_LEN: usize = 45;

/// Delivery identifier
///
/// Opaque key grouping the location data of one in-progress order. It is
/// embedded in MQTT topics and notification channel names, so only ASCII
/// alphanumerics, `-` and `_` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeliveryId(String);

impl TryFrom<&str> for DeliveryId {
    type Error = TrackerError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let valid = !value.is_empty()
            && value.len() <= MAX_DELIVERY_ID_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(TrackerError::InvalidDeliveryId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for DeliveryId {
    type Error = TrackerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<DeliveryId> for String {
    fn from(value: DeliveryId) -> Self {
        value.0
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl DeliveryId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the store notification channel for this delivery
    pub fn channel(&self) -> String {
        format!("{}{}", CHANNEL_PREFIX, self.0)
    }
}

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, TrackerError> {
        let coordinates = Self {
            latitude,
            longitude,
        };
        if !coordinates.is_valid() {
            return Err(TrackerError::InvalidCoordinates {
                latitude,
                longitude,
            });
        }
        Ok(coordinates)
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single reading from a courier device
///
/// Mirrors the shape of a browser `GeolocationPosition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    /// Time the fix was taken, milliseconds from Unix epoch
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub coords: FixCoords,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixCoords {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty in meters, None if not reported
    #[serde(default, deserialize_with = "deserialize_non_negative")]
    pub accuracy: Option<f64>,
    /// Ground speed in meters per second, None if not reported
    #[serde(default, deserialize_with = "deserialize_non_negative")]
    pub speed: Option<f64>,
    /// Direction of travel in degrees clockwise from true north
    #[serde(default, deserialize_with = "deserialize_finite")]
    pub heading: Option<f64>,
}

impl Fix {
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            coords: FixCoords {
                latitude,
                longitude,
                accuracy: None,
                speed: None,
                heading: None,
            },
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.coords.speed = Some(speed_mps);
        self
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.coords.heading = Some(heading);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.coords.accuracy = Some(accuracy);
        self
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.coords.latitude,
            longitude: self.coords.longitude,
        }
    }
}

/// Fields written to the store for one fix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationReport {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub accuracy_meters: Option<f64>,
}

impl TryFrom<&Fix> for LocationReport {
    type Error = TrackerError;

    fn try_from(fix: &Fix) -> Result<Self, Self::Error> {
        let position = Coordinates::new(fix.coords.latitude, fix.coords.longitude)?;
        Ok(Self {
            latitude: position.latitude,
            longitude: position.longitude,
            speed_kmh: fix
                .coords
                .speed
                .filter(|s| s.is_finite() && *s >= 0.0)
                .map(|s| s * MPS_TO_KMH),
            heading_degrees: fix
                .coords
                .heading
                .filter(|h| h.is_finite())
                .map(normalize_heading),
            accuracy_meters: fix
                .coords
                .accuracy
                .filter(|a| a.is_finite() && *a >= 0.0),
        })
    }
}

/// Fold a heading into `[0, 360)`
///
/// `rem_euclid` rounds tiny negative inputs up to exactly 360.
fn normalize_heading(heading: f64) -> f64 {
    let folded = heading.rem_euclid(360.0);
    if folded >= 360.0 {
        0.0
    } else {
        folded
    }
}

/// Current known location of the courier of one delivery
///
/// The store holds at most one of these per delivery id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub delivery_id: DeliveryId,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: Option<f64>,
    pub heading_degrees: Option<f64>,
    pub accuracy_meters: Option<f64>,
    /// Write counter, starts at 1 and grows by one on every update
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl LocationSample {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// True if `self` was written after `other` for the same delivery
    pub fn supersedes(&self, other: &LocationSample) -> bool {
        self.delivery_id == other.delivery_id && self.version > other.version
    }
}

/// Kind of row change carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// Live notification of a location row change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationChange {
    pub kind: ChangeKind,
    pub row: LocationSample,
}

/// Custom deserializers
mod serde_helpers {
    use serde::{self, Deserialize, Deserializer};

    pub fn deserialize_non_negative<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.filter(|v| v.is_finite() && *v >= 0.0))
    }

    pub fn deserialize_finite<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.filter(|v| v.is_finite()))
    }
}

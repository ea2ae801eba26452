// src/database/models.rs
use chrono::{DateTime, Utc};

use crate::errors::TrackerError;
use crate::models::{ChangeKind, DeliveryId, LocationSample};
use crate::store::UpsertOutcome;

#[derive(Debug, sqlx::FromRow)]
pub(super) struct LocationRow {
    delivery_id: String,
    latitude: f64,
    longitude: f64,
    speed_kmh: Option<f64>,
    heading_degrees: Option<f64>,
    accuracy_meters: Option<f64>,
    version: i64,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct UpsertRow {
    #[sqlx(flatten)]
    location: LocationRow,
    inserted: bool,
}

impl TryFrom<LocationRow> for LocationSample {
    type Error = TrackerError;

    fn try_from(row: LocationRow) -> Result<Self, Self::Error> {
        Ok(LocationSample {
            delivery_id: DeliveryId::try_from(row.delivery_id)?,
            latitude: row.latitude,
            longitude: row.longitude,
            speed_kmh: row.speed_kmh,
            heading_degrees: row.heading_degrees,
            accuracy_meters: row.accuracy_meters,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<UpsertRow> for UpsertOutcome {
    type Error = TrackerError;

    fn try_from(row: UpsertRow) -> Result<Self, Self::Error> {
        Ok(UpsertOutcome {
            kind: if row.inserted {
                ChangeKind::Insert
            } else {
                ChangeKind::Update
            },
            sample: row.location.try_into()?,
        })
    }
}

// src/database.rs
//! PostgreSQL location store
//!
//! Rows live in `courier_locations`, keyed by delivery id. A trigger publishes
//! every insert or update with `pg_notify` on the channel
//! `delivery_location:<delivery id>`, so live feeds are filtered server-side.
mod models;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgListener, PgPoolOptions},
    PgPool,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    errors::TrackerError,
    models::{DeliveryId, LocationChange, LocationReport, LocationSample},
    store::{LocationFeed, LocationStore, UpsertOutcome},
};
use models::{LocationRow, UpsertRow};

const FEED_CAPACITY: usize = 32;

/// Database client for courier locations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database and apply pending migrations
    pub async fn from_url(url: &str, max_connections: u32) -> Result<Self, TrackerError> {
        info!("Connecting to database, max_connections={}", max_connections);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                TrackerError::DatabaseConnectionError(e.to_string())
            })?;

        Self::new(pool).await
    }

    /// Wrap an existing pool, applying pending migrations
    pub async fn new(pool: PgPool) -> Result<Self, TrackerError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn pump(
        delivery_id: DeliveryId,
        mut listener: PgListener,
        tx: mpsc::Sender<Result<LocationChange, TrackerError>>,
    ) {
        loop {
            let item = match listener.try_recv().await {
                Ok(Some(notification)) => {
                    match serde_json::from_str::<LocationChange>(notification.payload()) {
                        Ok(change) => Ok(change),
                        Err(e) => {
                            warn!("Dropping malformed notification: {}", e);
                            continue;
                        }
                    }
                }
                // Listener reconnects on the next call; notifications may be lost
                Ok(None) => {
                    warn!("Notification connection for {} lost", delivery_id);
                    Err(TrackerError::Subscription("connection lost".to_string()))
                }
                Err(e) => {
                    error!("Notification listener for {} failed: {}", delivery_id, e);
                    let _ = tx.send(Err(TrackerError::Subscription(e.to_string()))).await;
                    break;
                }
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
        debug!("Feed for {} closed", delivery_id);
    }
}

#[async_trait]
impl LocationStore for Database {
    async fn fetch_latest(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<LocationSample>, TrackerError> {
        let row: Option<LocationRow> = sqlx::query_as(
            "SELECT delivery_id, latitude, longitude, speed_kmh, heading_degrees,
                accuracy_meters, version, updated_at
            FROM courier_locations
            WHERE delivery_id = $1
            ORDER BY updated_at DESC
            LIMIT 1",
        )
        .bind(delivery_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TrackerError::StoreRead(e.to_string()))?;

        row.map(LocationSample::try_from).transpose()
    }

    async fn upsert(
        &self,
        delivery_id: &DeliveryId,
        report: &LocationReport,
    ) -> Result<UpsertOutcome, TrackerError> {
        // `xmax = 0` only holds for a freshly inserted tuple
        let row: UpsertRow = sqlx::query_as(
            "INSERT INTO courier_locations AS cl (
                delivery_id, latitude, longitude, speed_kmh, heading_degrees, accuracy_meters
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (delivery_id) DO UPDATE SET
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                speed_kmh = EXCLUDED.speed_kmh,
                heading_degrees = EXCLUDED.heading_degrees,
                accuracy_meters = EXCLUDED.accuracy_meters,
                version = cl.version + 1,
                updated_at = now()
            RETURNING delivery_id, latitude, longitude, speed_kmh, heading_degrees,
                accuracy_meters, version, updated_at, (xmax = 0) AS inserted",
        )
        .bind(delivery_id.as_str())
        .bind(report.latitude)
        .bind(report.longitude)
        .bind(report.speed_kmh)
        .bind(report.heading_degrees)
        .bind(report.accuracy_meters)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TrackerError::StoreWrite(e.to_string()))?;

        row.try_into()
    }

    async fn subscribe(&self, delivery_id: &DeliveryId) -> Result<LocationFeed, TrackerError> {
        let channel = delivery_id.channel();
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| TrackerError::Subscription(e.to_string()))?;
        listener
            .listen(&channel)
            .await
            .map_err(|e| TrackerError::Subscription(e.to_string()))?;
        info!("Listening on {}", channel);

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let handle = tokio::spawn(Self::pump(delivery_id.clone(), listener, tx));
        Ok(LocationFeed::new(rx, handle))
    }
}

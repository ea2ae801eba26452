//! In-process location store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use super::{LocationFeed, LocationStore, UpsertOutcome};
use crate::errors::TrackerError;
use crate::models::{ChangeKind, DeliveryId, LocationChange, LocationReport, LocationSample};

const CHANGE_CAPACITY: usize = 256;
const FEED_CAPACITY: usize = 32;

/// Location store kept in memory, with broadcast change notifications
///
/// Rows and notifications are produced under the same lock, so notifications
/// for one delivery are emitted in write order.
pub struct MemoryStore {
    rows: Mutex<HashMap<DeliveryId, LocationSample>>,
    changes: Mutex<broadcast::Sender<LocationChange>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            rows: Mutex::new(HashMap::new()),
            changes: Mutex::new(tx),
        }
    }

    /// Number of rows stored for a delivery, zero or one
    pub async fn row_count(&self, delivery_id: &DeliveryId) -> usize {
        usize::from(self.rows.lock().await.contains_key(delivery_id))
    }

    /// Number of open live feeds
    pub async fn listener_count(&self) -> usize {
        self.changes.lock().await.receiver_count()
    }

    /// Drop every open feed, as if the notification connection was reset
    pub async fn reset_connections(&self) {
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        *self.changes.lock().await = tx;
        debug!("Reset all live feeds");
    }

    async fn pump(
        delivery_id: DeliveryId,
        mut changes: broadcast::Receiver<LocationChange>,
        tx: mpsc::Sender<Result<LocationChange, TrackerError>>,
    ) {
        loop {
            let item = match changes.recv().await {
                Ok(change) if change.row.delivery_id == delivery_id => Ok(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Feed for {} lagged, {} notifications lost", delivery_id, missed);
                    Err(TrackerError::Subscription(format!(
                        "{} notifications lost",
                        missed
                    )))
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
        debug!("Feed for {} closed", delivery_id);
    }
}

#[async_trait]
impl LocationStore for MemoryStore {
    async fn fetch_latest(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<LocationSample>, TrackerError> {
        Ok(self.rows.lock().await.get(delivery_id).cloned())
    }

    async fn upsert(
        &self,
        delivery_id: &DeliveryId,
        report: &LocationReport,
    ) -> Result<UpsertOutcome, TrackerError> {
        let mut rows = self.rows.lock().await;
        let (kind, version) = match rows.get(delivery_id) {
            Some(existing) => (ChangeKind::Update, existing.version + 1),
            None => (ChangeKind::Insert, 1),
        };
        let sample = LocationSample {
            delivery_id: delivery_id.clone(),
            latitude: report.latitude,
            longitude: report.longitude,
            speed_kmh: report.speed_kmh,
            heading_degrees: report.heading_degrees,
            accuracy_meters: report.accuracy_meters,
            version,
            updated_at: Utc::now(),
        };
        rows.insert(delivery_id.clone(), sample.clone());

        // No receivers is not an error
        let _ = self.changes.lock().await.send(LocationChange {
            kind,
            row: sample.clone(),
        });

        Ok(UpsertOutcome { kind, sample })
    }

    async fn subscribe(&self, delivery_id: &DeliveryId) -> Result<LocationFeed, TrackerError> {
        let changes = self.changes.lock().await.subscribe();
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let handle = tokio::spawn(Self::pump(delivery_id.clone(), changes, tx));
        Ok(LocationFeed::new(rx, handle))
    }
}

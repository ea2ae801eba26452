//! Location store client interface
//!
//! The store keeps one current location row per delivery and pushes a
//! notification for every insert or update of that row.

pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::TrackerError;
use crate::models::{ChangeKind, DeliveryId, LocationChange, LocationReport, LocationSample};

/// Result of an upsert
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    /// `Insert` for the first write of a delivery, `Update` afterwards
    pub kind: ChangeKind,
    pub sample: LocationSample,
}

#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Fetch the most recent row for a delivery, if any
    async fn fetch_latest(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<LocationSample>, TrackerError>;

    /// Insert the row for a delivery, or update it if it already exists
    ///
    /// Implementations must do this atomically, so concurrent writers for the
    /// same delivery never produce a second row.
    async fn upsert(
        &self,
        delivery_id: &DeliveryId,
        report: &LocationReport,
    ) -> Result<UpsertOutcome, TrackerError>;

    /// Open a live feed of changes to one delivery's row
    async fn subscribe(&self, delivery_id: &DeliveryId) -> Result<LocationFeed, TrackerError>;
}

/// Live change feed for one delivery
///
/// The feed owns the task pumping notifications from the store. Dropping the
/// feed stops that task, releasing the underlying channel.
pub struct LocationFeed {
    rx: mpsc::Receiver<Result<LocationChange, TrackerError>>,
    handle: JoinHandle<()>,
}

impl LocationFeed {
    pub fn new(
        rx: mpsc::Receiver<Result<LocationChange, TrackerError>>,
        handle: JoinHandle<()>,
    ) -> Self {
        Self { rx, handle }
    }

    /// Receive the next change
    ///
    /// `Some(Err(_))` means notifications may have been lost but the feed is
    /// still open. `None` means the feed has closed.
    pub async fn next(&mut self) -> Option<Result<LocationChange, TrackerError>> {
        self.rx.recv().await
    }
}

impl Drop for LocationFeed {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

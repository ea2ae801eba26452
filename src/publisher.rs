//! Location publisher
//!
//! Runs on the courier side: watches the device position of a delivery and
//! upserts every fix into the location store.

use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::TrackingConfig;
use crate::device::{PositionSource, PositionWatch, WatchOptions};
use crate::errors::TrackerError;
use crate::models::{DeliveryId, Fix, LocationReport};
use crate::store::{LocationStore, UpsertOutcome};

/// Observable state of a tracking session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStatus {
    pub is_tracking: bool,
    pub is_updating: bool,
    /// Localized message of the last failure, cleared by the next good write
    pub error: Option<&'static str>,
}

#[derive(Clone)]
pub struct LocationPublisher {
    store: Arc<dyn LocationStore>,
    source: Arc<dyn PositionSource>,
    config: TrackingConfig,
}

/// Running tracking session for one delivery
///
/// Dropping the handle stops sampling, like [`LocationPublisher::stop_tracking`]
/// without waiting.
pub struct TrackingHandle {
    delivery_id: DeliveryId,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    status: watch::Receiver<PublisherStatus>,
}

impl TrackingHandle {
    pub fn delivery_id(&self) -> &DeliveryId {
        &self.delivery_id
    }

    pub fn status(&self) -> watch::Receiver<PublisherStatus> {
        self.status.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl LocationPublisher {
    pub fn new(
        store: Arc<dyn LocationStore>,
        source: Arc<dyn PositionSource>,
        config: TrackingConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
        }
    }

    /// Write one fix for a delivery
    ///
    /// Retries store failures up to `write_attempts` times with doubling
    /// backoff. Fixes with invalid coordinates are rejected without a write.
    pub async fn update_location(
        &self,
        delivery_id: &DeliveryId,
        fix: &Fix,
    ) -> Result<UpsertOutcome, TrackerError> {
        let report = LocationReport::try_from(fix).inspect_err(|e| {
            warn!("Rejecting fix for {}: {}", delivery_id, e);
        })?;

        let mut backoff = self.config.write_backoff;
        let mut attempt = 1;
        loop {
            match self.store.upsert(delivery_id, &report).await {
                Ok(outcome) => {
                    debug!(
                        "Stored location for {}: {:?} version {}",
                        delivery_id, outcome.kind, outcome.sample.version
                    );
                    return Ok(outcome);
                }
                Err(e) if attempt < self.config.write_attempts => {
                    warn!(
                        "Location write for {} failed (attempt {}): {}",
                        delivery_id, attempt, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Error updating location for {}: {}", delivery_id, e);
                    return Err(e);
                }
            }
        }
    }

    /// One-shot fix for initial display
    pub async fn current_position(&self, delivery_id: &DeliveryId) -> Result<Fix, TrackerError> {
        self.source
            .current_position(delivery_id, WatchOptions::from(&self.config))
            .await
    }

    /// Begin continuous sampling for a delivery
    pub async fn start_tracking(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<TrackingHandle, TrackerError> {
        if !self.source.is_supported() {
            warn!("Cannot track {}: geolocation not supported", delivery_id);
            return Err(TrackerError::DeviceUnsupported);
        }

        let position_watch = self
            .source
            .watch_position(&delivery_id, WatchOptions::from(&self.config))
            .await?;
        info!("Started tracking {}", delivery_id);

        let (status_tx, status_rx) = watch::channel(PublisherStatus {
            is_tracking: true,
            ..Default::default()
        });
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(self.clone().run(
            delivery_id.clone(),
            position_watch,
            stop_rx,
            status_tx,
        ));

        Ok(TrackingHandle {
            delivery_id,
            stop: Some(stop_tx),
            task,
            status: status_rx,
        })
    }

    /// Stop sampling and wait for the session to wind down
    ///
    /// A write already in flight is allowed to finish.
    pub async fn stop_tracking(&self, mut handle: TrackingHandle) {
        if let Some(stop) = handle.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut handle.task).await {
            error!("Tracking task for {} failed: {}", handle.delivery_id, e);
        }
        info!("Stopped tracking {}", handle.delivery_id);
    }

    async fn run(
        self,
        delivery_id: DeliveryId,
        mut position_watch: PositionWatch,
        mut stop: oneshot::Receiver<()>,
        status: watch::Sender<PublisherStatus>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                item = position_watch.next() => match item {
                    Some(Ok(fix)) => {
                        status.send_modify(|s| s.is_updating = true);
                        let result = self.update_location(&delivery_id, &fix).await;
                        status.send_modify(|s| {
                            s.is_updating = false;
                            s.error = result.as_ref().err().map(TrackerError::user_message);
                        });
                    }
                    // Device errors never end the session
                    Some(Err(e)) => {
                        warn!("Geolocation error for {}: {}", delivery_id, e);
                        status.send_modify(|s| s.error = Some(e.user_message()));
                    }
                    None => {
                        warn!("Position watch for {} closed", delivery_id);
                        break;
                    }
                },
            }
        }

        drop(position_watch);
        status.send_modify(|s| {
            s.is_tracking = false;
            s.is_updating = false;
        });
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

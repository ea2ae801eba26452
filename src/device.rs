//! Device location sources
//!
//! A [`PositionSource`] delivers fixes from courier devices. Watches apply the
//! browser-style options: fixes older than `max_age` are dropped, and a
//! timeout error is reported whenever no fix arrives within `timeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_with::serde_as;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TrackingConfig;
use crate::errors::{DeviceError, TrackerError};
use crate::models::{DeliveryId, Fix};

const WATCH_CAPACITY: usize = 16;

type FixResult = Result<Fix, DeviceError>;

/// Sampling options for a position watch
///
/// Serialized with the browser `PositionOptions` field names, as devices
/// receive them.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchOptions {
    #[serde(rename = "enableHighAccuracy")]
    pub high_accuracy: bool,
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    #[serde(rename = "maximumAge")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub max_age: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from(&TrackingConfig::default())
    }
}

impl From<&TrackingConfig> for WatchOptions {
    fn from(config: &TrackingConfig) -> Self {
        Self {
            high_accuracy: config.high_accuracy,
            timeout: config.timeout,
            max_age: config.max_age,
        }
    }
}

#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Whether this source can deliver fixes at all
    fn is_supported(&self) -> bool;

    /// Start watching the device of a delivery
    async fn watch_position(
        &self,
        delivery_id: &DeliveryId,
        options: WatchOptions,
    ) -> Result<PositionWatch, TrackerError>;

    /// Wait for a single fix
    async fn current_position(
        &self,
        delivery_id: &DeliveryId,
        options: WatchOptions,
    ) -> Result<Fix, TrackerError> {
        let mut watch = self.watch_position(delivery_id, options).await?;
        match watch.next().await {
            Some(Ok(fix)) => Ok(fix),
            Some(Err(e)) => Err(e.into()),
            None => Err(DeviceError::PositionUnavailable.into()),
        }
    }
}

/// Stream of fixes or device errors from one watch
///
/// Dropping the watch stops it.
pub struct PositionWatch {
    rx: mpsc::Receiver<FixResult>,
    handle: JoinHandle<()>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PositionWatch {
    /// Apply `options` to a raw stream of device readings
    pub fn spawn(raw: mpsc::Receiver<FixResult>, options: WatchOptions) -> Self {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        let handle = tokio::spawn(Self::filter(raw, tx, options));
        Self {
            rx,
            handle,
            release: None,
        }
    }

    /// Run `release` when the watch is dropped
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    pub async fn next(&mut self) -> Option<FixResult> {
        self.rx.recv().await
    }

    async fn filter(
        mut raw: mpsc::Receiver<FixResult>,
        tx: mpsc::Sender<FixResult>,
        options: WatchOptions,
    ) {
        loop {
            let item = match tokio::time::timeout(options.timeout, raw.recv()).await {
                Err(_) => {
                    debug!("No fix within {:?}", options.timeout);
                    Err(DeviceError::Timeout)
                }
                Ok(None) => break,
                Ok(Some(Ok(fix))) => {
                    let age = (Utc::now() - fix.timestamp).to_std().unwrap_or_default();
                    if age > options.max_age {
                        debug!("Dropping stale fix, age {:?}", age);
                        continue;
                    }
                    Ok(fix)
                }
                Ok(Some(Err(e))) => Err(e),
            };
            if tx.send(item).await.is_err() {
                break;
            }
        }
    }
}

impl Drop for PositionWatch {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Routes raw device readings to the open watches of each delivery
///
/// Dispatch never waits: a watch whose buffer is full misses the reading.
#[derive(Default)]
pub struct FixRouter {
    routes: Mutex<HashMap<DeliveryId, Vec<(u64, mpsc::Sender<FixResult>)>>>,
    next_key: AtomicU64,
}

impl FixRouter {
    /// Open a new route for a delivery
    ///
    /// The returned key closes the route again through [`FixRouter::unregister`].
    pub fn register(&self, delivery_id: &DeliveryId) -> (u64, mpsc::Receiver<FixResult>) {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        if let Ok(mut routes) = self.routes.lock() {
            routes
                .entry(delivery_id.clone())
                .or_default()
                .push((key, tx));
        }
        (key, rx)
    }

    /// Close one route
    ///
    /// Returns true if no other watch of the delivery is left open.
    pub fn unregister(&self, delivery_id: &DeliveryId, key: u64) -> bool {
        let Ok(mut routes) = self.routes.lock() else {
            return false;
        };
        let Some(open) = routes.get_mut(delivery_id) else {
            return true;
        };
        open.retain(|(k, tx)| *k != key && !tx.is_closed());
        if open.is_empty() {
            debug!("Last watch of {} released", delivery_id);
            routes.remove(delivery_id);
            true
        } else {
            false
        }
    }

    /// Forward a reading to every watch of a delivery
    ///
    /// Returns false if no watch took the reading.
    pub fn dispatch(&self, delivery_id: &DeliveryId, item: FixResult) -> bool {
        let Ok(mut routes) = self.routes.lock() else {
            return false;
        };
        let Some(open) = routes.get_mut(delivery_id) else {
            return false;
        };

        let mut delivered = false;
        open.retain(|(_, tx)| match tx.try_send(item.clone()) {
            Ok(()) => {
                delivered = true;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Watch of {} is behind, dropping reading", delivery_id);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        if open.is_empty() {
            debug!("No watch left for {}, removing route", delivery_id);
            routes.remove(delivery_id);
        }
        delivered
    }

    pub fn is_watching(&self, delivery_id: &DeliveryId) -> bool {
        match self.routes.lock() {
            Ok(routes) => routes
                .get(delivery_id)
                .is_some_and(|open| open.iter().any(|(_, tx)| !tx.is_closed())),
            Err(_) => false,
        }
    }
}

/// In-process source fed through [`ChannelPositionSource::push`]
pub struct ChannelPositionSource {
    router: Arc<FixRouter>,
    supported: bool,
}

impl Default for ChannelPositionSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPositionSource {
    pub fn new() -> Self {
        Self {
            router: Arc::default(),
            supported: true,
        }
    }

    /// A source for a device without location support
    pub fn unsupported() -> Self {
        Self {
            router: Arc::default(),
            supported: false,
        }
    }

    pub fn push(&self, delivery_id: &DeliveryId, fix: Fix) -> bool {
        self.router.dispatch(delivery_id, Ok(fix))
    }

    pub fn push_error(&self, delivery_id: &DeliveryId, error: DeviceError) -> bool {
        self.router.dispatch(delivery_id, Err(error))
    }

    pub fn is_watching(&self, delivery_id: &DeliveryId) -> bool {
        self.router.is_watching(delivery_id)
    }
}

#[async_trait]
impl PositionSource for ChannelPositionSource {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn watch_position(
        &self,
        delivery_id: &DeliveryId,
        options: WatchOptions,
    ) -> Result<PositionWatch, TrackerError> {
        if !self.supported {
            warn!("Position watch requested on unsupported source");
            return Err(TrackerError::DeviceUnsupported);
        }
        let (key, raw) = self.router.register(delivery_id);
        let router = self.router.clone();
        let delivery_id = delivery_id.clone();
        Ok(PositionWatch::spawn(raw, options).on_release(move || {
            router.unregister(&delivery_id, key);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn id() -> DeliveryId {
        DeliveryId::try_from("order-1").unwrap()
    }

    #[test]
    fn watch_options_use_browser_names() {
        let json = serde_json::to_value(WatchOptions::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"enableHighAccuracy": true, "timeout": 10000, "maximumAge": 5000})
        );
    }

    #[tokio::test]
    async fn fresh_fixes_pass_through() {
        let source = ChannelPositionSource::new();
        let mut watch = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();

        assert!(source.push(&id(), Fix::new(Utc::now(), 1.0, 2.0)));
        let fix = watch.next().await.unwrap().unwrap();
        assert_eq!(fix.coords.latitude, 1.0);
    }

    #[tokio::test]
    async fn stale_fixes_are_dropped() {
        let source = ChannelPositionSource::new();
        let mut watch = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();

        let old = Utc::now() - TimeDelta::seconds(30);
        source.push(&id(), Fix::new(old, 9.0, 9.0));
        source.push(&id(), Fix::new(Utc::now(), 1.0, 1.0));

        let fix = watch.next().await.unwrap().unwrap();
        assert_eq!(fix.coords.latitude, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_reports_timeout_and_keeps_watching() {
        let source = ChannelPositionSource::new();
        let mut watch = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();

        assert_eq!(watch.next().await, Some(Err(DeviceError::Timeout)));

        source.push(&id(), Fix::new(Utc::now(), 1.0, 1.0));
        assert!(watch.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn device_errors_are_forwarded() {
        let source = ChannelPositionSource::new();
        let mut watch = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();

        source.push_error(&id(), DeviceError::PermissionDenied);
        assert_eq!(watch.next().await, Some(Err(DeviceError::PermissionDenied)));
    }

    #[tokio::test]
    async fn unsupported_source_refuses_watch() {
        let source = ChannelPositionSource::unsupported();
        let result = source.watch_position(&id(), WatchOptions::default()).await;
        assert!(matches!(result, Err(TrackerError::DeviceUnsupported)));
    }

    #[tokio::test]
    async fn dropped_watch_stops_routing() {
        let source = ChannelPositionSource::new();
        let watch = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();
        assert!(source.is_watching(&id()));

        drop(watch);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!source.push(&id(), Fix::new(Utc::now(), 1.0, 1.0)));
        assert!(!source.is_watching(&id()));
    }

    #[tokio::test]
    async fn every_watch_of_a_delivery_gets_the_fix() {
        let source = ChannelPositionSource::new();
        let mut first = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();
        let mut second = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();

        assert!(source.push(&id(), Fix::new(Utc::now(), 1.0, 1.0)));
        assert!(first.next().await.unwrap().is_ok());
        assert!(second.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn unread_watch_never_blocks_push() {
        let source = ChannelPositionSource::new();
        let mut watch = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();

        let delivered = (0..40)
            .filter(|i| source.push(&id(), Fix::new(Utc::now(), f64::from(*i), 0.0)))
            .count();
        assert_eq!(delivered, WATCH_CAPACITY);

        let fix = watch.next().await.unwrap().unwrap();
        assert_eq!(fix.coords.latitude, 0.0);
        assert!(source.is_watching(&id()));
    }

    #[test]
    fn only_the_last_route_reports_release() {
        let router = FixRouter::default();
        let (first, _rx1) = router.register(&id());
        let (second, _rx2) = router.register(&id());
        assert_ne!(first, second);

        assert!(!router.unregister(&id(), first));
        assert!(router.is_watching(&id()));
        assert!(router.unregister(&id(), second));
        assert!(!router.is_watching(&id()));
    }

    #[tokio::test]
    async fn dropping_one_watch_keeps_the_other() {
        let source = ChannelPositionSource::new();
        let one_shot = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();
        let mut session = source
            .watch_position(&id(), WatchOptions::default())
            .await
            .unwrap();

        drop(one_shot);
        assert!(source.is_watching(&id()));
        assert!(source.push(&id(), Fix::new(Utc::now(), 2.0, 2.0)));
        assert_eq!(session.next().await.unwrap().unwrap().coords.latitude, 2.0);
    }

    #[tokio::test]
    async fn current_position_takes_one_fix() {
        let source = std::sync::Arc::new(ChannelPositionSource::new());
        let pusher = source.clone();
        let task = tokio::spawn(async move {
            while !pusher.is_watching(&id()) {
                tokio::task::yield_now().await;
            }
            pusher.push(&id(), Fix::new(Utc::now(), 3.0, 4.0))
        });

        let fix = source
            .current_position(&id(), WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(fix.coords.longitude, 4.0);
        assert!(task.await.unwrap());
    }
}

//! Location subscriber
//!
//! Runs on the customer side. Activation opens the live feed for a delivery,
//! seeds the state from the latest stored row, then applies notifications as
//! they arrive. Notifications replace the known sample wholesale, but only if
//! they carry a newer version.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SubscriberConfig;
use crate::errors::messages;
use crate::models::{ChangeKind, DeliveryId, LocationChange, LocationSample};
use crate::store::{LocationFeed, LocationStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Live,
    Lost,
}

/// What the customer currently knows about the courier
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberState {
    pub location: Option<LocationSample>,
    pub is_loading: bool,
    pub error: Option<&'static str>,
    pub connection: ConnectionState,
}

impl Default for SubscriberState {
    fn default() -> Self {
        Self {
            location: None,
            is_loading: true,
            error: None,
            connection: ConnectionState::Connecting,
        }
    }
}

impl SubscriberState {
    pub fn has_location(&self) -> bool {
        self.location.is_some()
    }
}

pub struct LocationSubscriber {
    store: Arc<dyn LocationStore>,
    config: SubscriberConfig,
}

/// Active subscription to one delivery
///
/// Owns the background task; deactivating or dropping it closes the live
/// feed and cancels any fetch still in flight.
pub struct Subscription {
    delivery_id: DeliveryId,
    state: watch::Receiver<SubscriberState>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn delivery_id(&self) -> &DeliveryId {
        &self.delivery_id
    }

    pub fn state(&self) -> watch::Receiver<SubscriberState> {
        self.state.clone()
    }

    pub fn current(&self) -> SubscriberState {
        self.state.borrow().clone()
    }

    /// Tear down and wait until the feed is released
    pub async fn deactivate(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        info!("Deactivated subscription for {}", self.delivery_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl LocationSubscriber {
    pub fn new(store: Arc<dyn LocationStore>, config: SubscriberConfig) -> Self {
        Self { store, config }
    }

    pub fn activate(&self, delivery_id: DeliveryId) -> Subscription {
        let (tx, rx) = watch::channel(SubscriberState::default());
        let task = tokio::spawn(Self::run(
            self.store.clone(),
            self.config.clone(),
            delivery_id.clone(),
            tx,
        ));
        info!("Activated subscription for {}", delivery_id);

        Subscription {
            delivery_id,
            state: rx,
            task,
        }
    }

    async fn run(
        store: Arc<dyn LocationStore>,
        config: SubscriberConfig,
        delivery_id: DeliveryId,
        state: watch::Sender<SubscriberState>,
    ) {
        let mut backoff = Backoff::new(config.reconnect_initial, config.reconnect_max);
        loop {
            // Subscribe before fetching so no write falls between the two
            let feed = match store.subscribe(&delivery_id).await {
                Ok(feed) => feed,
                Err(e) => {
                    warn!("Could not subscribe to {}: {}", delivery_id, e);
                    // Seed from the stored row even without a live feed
                    Self::sync(&*store, &delivery_id, &state, ConnectionState::Lost).await;
                    tokio::time::sleep(backoff.next_delay()).await;
                    continue;
                }
            };

            if Self::sync(&*store, &delivery_id, &state, ConnectionState::Live).await {
                backoff.reset();
            }
            Self::follow(&*store, &delivery_id, &state, feed).await;

            let delay = backoff.next_delay();
            info!("Reconnecting feed for {} in {:?}", delivery_id, delay);
            tokio::time::sleep(delay).await;
        }
    }

    /// Apply notifications until the feed closes
    async fn follow(
        store: &dyn LocationStore,
        delivery_id: &DeliveryId,
        state: &watch::Sender<SubscriberState>,
        mut feed: LocationFeed,
    ) {
        while let Some(item) = feed.next().await {
            match item {
                Ok(change) => apply(state, delivery_id, change),
                Err(e) => {
                    // Notifications may be missing, re-read the row
                    warn!("Live feed for {} interrupted: {}", delivery_id, e);
                    mark_lost(state);
                    Self::sync(store, delivery_id, state, ConnectionState::Live).await;
                }
            }
        }
        warn!("Live feed for {} closed", delivery_id);
        mark_lost(state);
    }

    /// Fetch the latest row and merge it into the state
    ///
    /// `connection` is the feed state to report once the fetch succeeds.
    async fn sync(
        store: &dyn LocationStore,
        delivery_id: &DeliveryId,
        state: &watch::Sender<SubscriberState>,
        connection: ConnectionState,
    ) -> bool {
        match store.fetch_latest(delivery_id).await {
            Ok(latest) => {
                state.send_modify(|s| {
                    if let Some(latest) = latest {
                        let newer = match &s.location {
                            Some(current) => latest.supersedes(current),
                            None => true,
                        };
                        if newer {
                            s.location = Some(latest);
                        }
                    }
                    s.is_loading = false;
                    s.connection = connection;
                    s.error = match connection {
                        ConnectionState::Lost => Some(messages::CONNECTION_LOST),
                        _ => None,
                    };
                });
                true
            }
            Err(e) => {
                error!("Error fetching delivery location for {}: {}", delivery_id, e);
                state.send_modify(|s| {
                    s.location = None;
                    s.is_loading = false;
                    s.error = Some(e.user_message());
                });
                false
            }
        }
    }
}

fn apply(state: &watch::Sender<SubscriberState>, delivery_id: &DeliveryId, change: LocationChange) {
    if change.row.delivery_id != *delivery_id {
        warn!(
            "Ignoring notification for {} on feed for {}",
            change.row.delivery_id, delivery_id
        );
        return;
    }
    state.send_if_modified(|s| match &s.location {
        // A recreated row starts its version over
        Some(current)
            if !change.row.supersedes(current)
                && !(change.kind == ChangeKind::Insert
                    && change.row.updated_at > current.updated_at) =>
        {
            debug!(
                "Discarding stale {:?} version {} (have {})",
                change.kind, change.row.version, current.version
            );
            false
        }
        _ => {
            debug!("Location update received: {:?}", change.kind);
            s.location = Some(change.row);
            true
        }
    });
}

fn mark_lost(state: &watch::Sender<SubscriberState>) {
    state.send_modify(|s| {
        s.connection = ConnectionState::Lost;
        s.error = Some(messages::CONNECTION_LOST);
    });
}

/// Doubling delay, capped at `max`
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

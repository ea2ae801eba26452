//! Delivery tracking gateway

use std::collections::HashMap;
use std::sync::Arc;

use delivery_tracker::{
    config::{AppConfig, ViewerConfig},
    database::Database,
    errors::TrackerError,
    map::{render_panel, MapConfig, MapInput},
    models::DeliveryId,
    mqtt::{MqttClient, MqttClientBuilder, TrackingCommand},
    publisher::{LocationPublisher, TrackingHandle},
    subscriber::LocationSubscriber,
};
use tokio::signal;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), TrackerError> {
    #[cfg(feature = "dotenvy")]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration, preferring environment variables and config files
    let config = AppConfig::load()?;
    config.validate()?;

    let db = Arc::new(
        Database::from_url(&config.database.url, config.database.max_connections).await?,
    );

    let mqtt_client = MqttClientBuilder::new(&config.mqtt)?.connect().await?;
    let publisher = LocationPublisher::new(
        db.clone(),
        mqtt_client.source(),
        config.tracking.clone(),
    );
    let subscriber = LocationSubscriber::new(db.clone(), config.subscriber.clone());

    let viewer = async {
        match &config.viewer {
            Some(viewer) => run_viewer(&subscriber, viewer, &config.map).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        result = run_gateway(mqtt_client, publisher, &config.map) => {
            info!("Gateway completed: {:?}", result);
        }
        result = viewer => {
            info!("Viewer completed: {:?}", result);
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // Dropped tracking handles stop their sessions here

    Ok(())
}

/// Start and stop tracking sessions on courier commands
async fn run_gateway(
    mut mqtt_client: MqttClient,
    publisher: LocationPublisher,
    map: &MapConfig,
) -> Result<(), TrackerError> {
    let mut sessions: HashMap<DeliveryId, TrackingHandle> = HashMap::new();

    while let Some((delivery_id, command)) = mqtt_client.recv().await {
        sessions.retain(|id, handle| {
            if handle.is_finished() {
                warn!("Tracking session for {} ended on its own", id);
            }
            !handle.is_finished()
        });

        match command {
            TrackingCommand::Start if sessions.contains_key(&delivery_id) => {
                debug!("Already tracking {}", delivery_id);
            }
            TrackingCommand::Start => match publisher.start_tracking(delivery_id.clone()).await {
                Ok(handle) => {
                    tokio::spawn(show_courier_position(
                        publisher.clone(),
                        delivery_id.clone(),
                        map.clone(),
                    ));
                    sessions.insert(delivery_id, handle);
                }
                Err(e) => error!(
                    "Could not start tracking {}: {} ({})",
                    delivery_id,
                    e,
                    e.user_message()
                ),
            },
            TrackingCommand::Stop => match sessions.remove(&delivery_id) {
                Some(handle) => publisher.stop_tracking(handle).await,
                None => debug!("Not tracking {}", delivery_id),
            },
        }
    }

    Ok(())
}

/// Log the courier's own position once, as the courier map would show it
async fn show_courier_position(
    publisher: LocationPublisher,
    delivery_id: DeliveryId,
    map: MapConfig,
) {
    match publisher.current_position(&delivery_id).await {
        Ok(fix) => {
            let panel = render_panel(
                &map,
                &MapInput {
                    courier: Some(fix.coordinates()),
                    ..Default::default()
                },
            );
            info!(
                "Courier of {} at lat={:.6} lon={:.6}",
                delivery_id, fix.coords.latitude, fix.coords.longitude
            );
            match serde_json::to_string(&panel) {
                Ok(json) => debug!("Courier map: {}", json),
                Err(e) => warn!("Could not serialize courier map: {}", e),
            }
        }
        Err(e) => warn!("No current position for {}: {}", delivery_id, e),
    }
}

/// Follow one delivery as its customer would, logging each map view
async fn run_viewer(
    subscriber: &LocationSubscriber,
    viewer: &ViewerConfig,
    map: &MapConfig,
) -> Result<(), TrackerError> {
    let delivery_id = DeliveryId::try_from(viewer.delivery_id.as_str())?;
    let subscription = subscriber.activate(delivery_id);
    let mut state = subscription.state();

    loop {
        let current = state.borrow_and_update().clone();
        let panel = render_panel(
            map,
            &MapInput {
                courier: current.location.as_ref().map(|l| l.coordinates()),
                customer: viewer.customer,
                restaurant: viewer.restaurant,
                restaurant_name: viewer.restaurant_name.clone(),
                customer_address: viewer.customer_address.clone(),
            },
        );
        if let Some(message) = current.error {
            warn!("Viewer for {}: {}", subscription.delivery_id(), message);
        }
        info!("Map view: {}", serde_json::to_string(&panel)?);

        if state.changed().await.is_err() {
            break;
        }
    }

    subscription.deactivate().await;
    Ok(())
}

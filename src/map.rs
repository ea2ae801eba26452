//! Map view computation
//!
//! Turns the known courier, customer and restaurant positions into a
//! description of what the map should show: markers, the route line, the
//! viewport and overlays. Drawing it is left to whatever map widget consumes
//! the view.

use serde::{Deserialize, Serialize};

use crate::errors::{messages, TrackerError};
use crate::models::Coordinates;

const COURIER_COLOR: &str = "#8b5cf6";
const CUSTOMER_COLOR: &str = "#22c55e";
const RESTAURANT_COLOR: &str = "#ef4444";

pub const AWAITING_TITLE: &str = "Aguardando rastreamento";
pub const AWAITING_MESSAGE: &str =
    "O rastreamento em tempo real será exibido quando seu pedido sair para entrega.";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub default_center: Coordinates,
    pub default_zoom: u8,
    /// Zoom used when following the courier alone
    pub follow_zoom: u8,
    pub max_zoom: u8,
    pub tile_url: String,
    pub attribution: String,
    /// Padding in pixels kept around fitted bounds
    pub fit_padding: [u32; 2],
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            default_center: Coordinates {
                latitude: -15.7801,
                longitude: -47.9292,
            },
            default_zoom: 13,
            follow_zoom: 15,
            max_zoom: 19,
            tile_url: "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            attribution: "© OpenStreetMap contributors".to_string(),
            fit_padding: [50, 50],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerRole {
    Courier,
    Customer,
    Restaurant,
}

impl MarkerRole {
    fn glyph(&self) -> Glyph {
        match self {
            MarkerRole::Courier => Glyph {
                color: COURIER_COLOR,
                size_px: 40,
            },
            MarkerRole::Customer => Glyph {
                color: CUSTOMER_COLOR,
                size_px: 36,
            },
            MarkerRole::Restaurant => Glyph {
                color: RESTAURANT_COLOR,
                size_px: 36,
            },
        }
    }

    fn legend_label(&self) -> &'static str {
        match self {
            MarkerRole::Courier => "Entregador",
            MarkerRole::Customer => "Você",
            MarkerRole::Restaurant => "Restaurante",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Glyph {
    pub color: &'static str,
    pub size_px: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub role: MarkerRole,
    pub position: Coordinates,
    pub glyph: Glyph,
    pub popup: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteLine {
    pub from: Coordinates,
    pub to: Coordinates,
    pub color: &'static str,
    pub weight: u8,
    pub opacity: f32,
    pub dash: &'static str,
}

/// Axis-aligned box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Bounds {
    fn around(point: Coordinates) -> Self {
        Self {
            min_lat: point.latitude,
            max_lat: point.latitude,
            min_lon: point.longitude,
            max_lon: point.longitude,
        }
    }

    fn extend(&mut self, point: Coordinates) {
        self.min_lat = self.min_lat.min(point.latitude);
        self.max_lat = self.max_lat.max(point.latitude);
        self.min_lon = self.min_lon.min(point.longitude);
        self.max_lon = self.max_lon.max(point.longitude);
    }

    pub fn contains(&self, point: &Coordinates) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lon
            && point.longitude <= self.max_lon
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Viewport {
    Center { center: Coordinates, zoom: u8 },
    Fit { bounds: Bounds, padding_px: [u32; 2] },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overlay {
    pub title: &'static str,
    pub message: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegendEntry {
    pub label: &'static str,
    pub color: &'static str,
}

/// Everything the map should display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapView {
    pub viewport: Viewport,
    pub markers: Vec<Marker>,
    pub route: Option<RouteLine>,
    pub overlay: Option<Overlay>,
    pub legend: Vec<LegendEntry>,
    pub tile_url: String,
    pub attribution: String,
}

impl MapView {
    pub fn marker(&self, role: MarkerRole) -> Option<&Marker> {
        self.markers.iter().find(|m| m.role == role)
    }
}

/// Either a map, or the static panel shown when the map cannot be built
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "panel", rename_all = "snake_case")]
pub enum MapPanel {
    Map(MapView),
    Error { message: &'static str },
}

/// Inputs of one render
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapInput {
    pub courier: Option<Coordinates>,
    pub customer: Option<Coordinates>,
    pub restaurant: Option<Coordinates>,
    pub restaurant_name: Option<String>,
    pub customer_address: Option<String>,
}

/// Validated map configuration, ready to render views
#[derive(Debug, Clone)]
pub struct MapSurface {
    config: MapConfig,
}

impl MapSurface {
    pub fn new(config: MapConfig) -> Result<Self, TrackerError> {
        let fail = |message: &str| Err(TrackerError::MapInit(message.to_string()));

        if !config.default_center.is_valid() {
            return fail("default center is outside WGS84 range");
        }
        if config.max_zoom == 0 || config.max_zoom > 22 {
            return fail("max zoom must be between 1 and 22");
        }
        if config.default_zoom > config.max_zoom || config.follow_zoom > config.max_zoom {
            return fail("zoom levels cannot exceed max zoom");
        }
        if !["{z}", "{x}", "{y}"]
            .iter()
            .all(|p| config.tile_url.contains(p))
        {
            return fail("tile url must contain {z}, {x} and {y}");
        }
        Ok(Self { config })
    }

    pub fn render(&self, input: &MapInput) -> MapView {
        let mut markers = Vec::with_capacity(3);

        if let Some(courier) = input.courier {
            markers.push(marker(
                MarkerRole::Courier,
                courier,
                "🛵 Entregador\nSua entrega está a caminho!".to_string(),
            ));
        }
        if let Some(customer) = input.customer {
            let popup = match &input.customer_address {
                Some(address) => format!("📍 Seu Endereço\n{}", address),
                None => "📍 Seu Endereço".to_string(),
            };
            markers.push(marker(MarkerRole::Customer, customer, popup));
        }
        if let Some(restaurant) = input.restaurant {
            let popup = match &input.restaurant_name {
                Some(name) => format!("🏪 {}\nRestaurante", name),
                None => "🏪 Restaurante".to_string(),
            };
            markers.push(marker(MarkerRole::Restaurant, restaurant, popup));
        }

        let (viewport, route) = match (input.courier, input.customer) {
            (Some(courier), Some(customer)) => {
                let mut bounds = Bounds::around(courier);
                bounds.extend(customer);
                if let Some(restaurant) = input.restaurant {
                    bounds.extend(restaurant);
                }
                let route = RouteLine {
                    from: courier,
                    to: customer,
                    color: COURIER_COLOR,
                    weight: 3,
                    opacity: 0.7,
                    dash: "10, 10",
                };
                (
                    Viewport::Fit {
                        bounds,
                        padding_px: self.config.fit_padding,
                    },
                    Some(route),
                )
            }
            (Some(courier), None) => (
                Viewport::Center {
                    center: courier,
                    zoom: self.config.follow_zoom,
                },
                None,
            ),
            (None, _) => (
                Viewport::Center {
                    center: self.config.default_center,
                    zoom: self.config.default_zoom,
                },
                None,
            ),
        };

        let overlay = input.courier.is_none().then_some(Overlay {
            title: AWAITING_TITLE,
            message: AWAITING_MESSAGE,
        });

        let mut legend = vec![
            legend_entry(MarkerRole::Courier),
            legend_entry(MarkerRole::Customer),
        ];
        if input.restaurant.is_some() {
            legend.push(legend_entry(MarkerRole::Restaurant));
        }

        MapView {
            viewport,
            markers,
            route,
            overlay,
            legend,
            tile_url: self.config.tile_url.clone(),
            attribution: self.config.attribution.clone(),
        }
    }
}

fn marker(role: MarkerRole, position: Coordinates, popup: String) -> Marker {
    Marker {
        role,
        position,
        glyph: role.glyph(),
        popup,
    }
}

fn legend_entry(role: MarkerRole) -> LegendEntry {
    LegendEntry {
        label: role.legend_label(),
        color: role.glyph().color,
    }
}

/// Build the surface and render, falling back to the error panel
pub fn render_panel(config: &MapConfig, input: &MapInput) -> MapPanel {
    match MapSurface::new(config.clone()) {
        Ok(surface) => MapPanel::Map(surface.render(input)),
        Err(e) => {
            tracing::error!("Error initializing map: {}", e);
            MapPanel::Error {
                message: messages::LOAD_MAP,
            }
        }
    }
}

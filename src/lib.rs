//! Courier location tracking for deliveries
//!
//! Couriers publish position fixes which are upserted as the single current
//! location of their delivery; customers subscribe to that location and get a
//! map view computed from it.

pub mod config;
pub mod database;
pub mod device;
pub mod errors;
pub mod map;
pub mod models;
pub mod mqtt;
pub mod publisher;
pub mod store;
pub mod subscriber;

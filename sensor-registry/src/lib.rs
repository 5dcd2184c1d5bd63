//! Sensor Registry - access control and mount history for field equipment.

pub mod config;
pub mod models;
pub mod services;
pub mod startup;

pub mod api;
pub mod apns;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod delivery;
pub mod expo;
pub mod gate;
pub mod generator;
pub mod history;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod provider;
pub mod scheduler;
pub mod store;
pub mod template;

#[cfg(test)]
mod testing;

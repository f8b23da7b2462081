pub mod alerts;
pub mod analytics;
pub mod batching;
pub mod config;
pub mod context;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod registry;
pub mod rest;
pub mod store;
pub mod validate;

pub use config::Config;
pub use context::Monitor;
pub use errors::{Error, Result};

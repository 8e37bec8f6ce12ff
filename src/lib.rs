pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod help;
pub mod metrics;
pub mod progress;
pub mod rate_limit;

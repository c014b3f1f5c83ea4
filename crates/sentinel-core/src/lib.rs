pub mod config;
pub mod discovery;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod resilience;
pub mod sqlite;

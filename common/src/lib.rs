// Common library for the class reminder dispatch engine

pub mod channels;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod finder;
pub mod ledger;
pub mod models;
pub mod notifier;
pub mod resolver;
pub mod storage;
pub mod telemetry;
pub mod templates;
pub mod window;

pub mod catalog;
pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod exception;
pub mod kyverno;
pub mod leader;
pub mod logging;
pub mod metrics;
pub mod report;
pub mod retry;
pub mod server;
pub mod violation;

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod error;
pub mod interchange;
pub mod messages;
pub mod shutdown;
pub mod transport;

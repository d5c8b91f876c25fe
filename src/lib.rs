pub mod capture;
pub mod config;
pub mod consumer;
pub mod dns;
pub mod framestream;
pub mod message;
pub mod metrics;
pub mod relay;
pub mod router;
pub mod transform;
pub mod worker;

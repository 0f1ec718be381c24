pub mod config;
pub mod consumer;
pub mod dataset;
pub mod error;
pub mod http;
pub mod inference;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod persist;
pub mod publisher;
pub mod report;
pub mod sampler;

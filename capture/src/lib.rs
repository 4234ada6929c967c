pub mod api;
pub mod config;
pub mod consent;
pub mod endpoint;
pub mod enrichment;
pub mod event;
pub mod identity;
pub mod ip;
pub mod limiters;
pub mod pipeline;
pub mod processor;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod stores;
pub mod time;

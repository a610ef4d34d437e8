pub mod config;
pub mod engine;
#[cfg(feature = "curl")]
pub mod fetch;
pub mod humanize;
pub mod multiplex;
pub mod observability;
pub mod reactor;

pub mod api;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod format;
pub mod job;
pub mod metadata;
pub mod rate_limit;
pub mod request;
pub mod resolver;
pub mod retention;

pub mod apis;
pub mod config;
pub mod constants;
pub mod dates;
pub mod error;
pub mod infra;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod query;
pub mod server;
pub mod storage;
pub mod table;
pub mod types;

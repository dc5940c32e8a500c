pub mod caching;
pub mod config;
pub mod dedup;
pub mod logging;
pub mod notify;

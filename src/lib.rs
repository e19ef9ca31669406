pub mod app;
pub mod callrecord;
pub mod config;
pub mod error;
pub mod metrics;
pub mod net_tool;
pub mod proxy;
pub mod version;

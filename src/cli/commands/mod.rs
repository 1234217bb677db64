//! CLI command implementations

pub mod cache;
pub mod config;
pub mod ports;

pub use cache::execute as cache;
pub use config::execute as config;
pub use ports::execute as ports;

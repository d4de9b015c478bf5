pub mod cache;
pub mod config;
pub mod loader;
pub mod sources;

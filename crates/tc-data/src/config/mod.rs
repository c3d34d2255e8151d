//! Cache configuration module

pub mod cache_config;

pub use cache_config::*;

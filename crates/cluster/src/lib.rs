//! Worker node registry, discovery and the background-refreshed pool.

pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
pub mod pool;
pub mod probe;
pub mod registry;

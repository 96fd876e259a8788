//! Batch evaluation worker: configuration and wiring for the
//! `pixaris-worker` binary.

pub mod config;
pub mod run;

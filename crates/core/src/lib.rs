//! Domain types and collaborator contracts shared by every pixaris crate.
//!
//! Holds no I/O of its own: the retry wrapper, the hyperparameter
//! expander and the traits implemented by dataset sources, workflow
//! executors and result sinks.

pub mod dataset;
pub mod error;
pub mod executor;
pub mod hyperparameters;
pub mod retry;
pub mod sink;
pub mod types;

//! Job dispatch and batch orchestration over a worker pool.
//!
//! [`dispatcher::JobDispatcher`] runs one job with retries across nodes;
//! [`orchestrator::BatchOrchestrator`] drives whole datasets, optionally
//! once per hyperparameter grid point, and hands results to a sink.

pub mod dataset;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod sink;

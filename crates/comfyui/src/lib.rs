//! ComfyUI REST client and workflow executor.
//!
//! Provides typed history parsing, API-format workflow editing and
//! validation, HTTP API wrappers, and the [`WorkflowExecutor`]
//! implementations used to run pixaris jobs on ComfyUI servers.
//!
//! [`WorkflowExecutor`]: pixaris_core::executor::WorkflowExecutor

pub mod api;
pub mod executor;
pub mod history;
pub mod mock;
pub mod workflow;

//! # mqroute engine
//!
//! Routing, transformation and dispatch for bus messages.
//!
//! ## Architecture
//! ```text
//! transport ──▶ Dispatcher::on_message(topic, payload, retained)
//!                 ├── topic match + filter per rule
//!                 ├── Pipeline::decode        builtin → datamap → alldata → JSON
//!                 ├── TargetResolver          function | dispatch table | list
//!                 └── JobQueue (FIFO)
//!                       └── N workers ──▶ render fields ──▶ Handler (timeout)
//!
//! PeriodicScheduler ──▶ PeriodicTask ──▶ user function(services)
//! ```

pub mod dispatcher;
pub mod format;
pub mod functions;
pub mod periodic;
pub mod queue;
pub mod registry;
pub mod targets;
pub mod templates;
pub mod topic;
pub mod transform;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::{DispatchOptions, Dispatcher, DispatcherStats};
pub use functions::FunctionTable;
pub use periodic::{PeriodicScheduler, PeriodicTask};
pub use queue::{JobQueue, QueueStats};
pub use registry::HandlerRegistry;
pub use targets::TargetResolver;
pub use templates::DirTemplates;
pub use transform::Pipeline;
pub use worker::{invoke_with_timeout, Invocation, JobOutcome, JobProcessor};

//! # mqroute core
//! Shared vocabulary of the router: errors, configuration, the data model
//! that flows from an inbound message to a handler invocation, and the
//! boundary traits the engine talks to.

pub mod config;
pub mod error;
pub mod service;
pub mod traits;
pub mod types;

pub use error::{Result, RouterError};
pub use service::ServiceContext;

//! optrack - Concurrency-safe tracking of background operations
//!
//! This crate contains the operation entity, the registry that owns live
//! operations plus a capped history of finished ones, and the ports
//! (interfaces) used to hand listener callbacks off to a UI thread. It has
//! no dependency on any UI toolkit - rendering and the main-loop dispatch
//! primitive are supplied by the embedding application.

pub mod domain;
pub mod error;
pub mod ports;
pub mod registry;

// Re-exports for ergonomics
pub use domain::*;
pub use error::*;
pub use ports::*;
pub use registry::*;

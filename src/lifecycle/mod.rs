//! Coordinator lifecycle
//!
//! The status transitions themselves live in the shared state machine; this
//! module drives them from transport start results and network events.

mod controller;

pub use controller::{LifecycleContext, LifecycleController};

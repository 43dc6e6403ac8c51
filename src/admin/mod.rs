//! Administrative surface
//!
//! Operators address coordinator instances by id over a length-prefixed
//! JSON protocol on TCP.

mod directory;
mod server;

pub use directory::CoordinatorDirectory;
pub use server::serve;

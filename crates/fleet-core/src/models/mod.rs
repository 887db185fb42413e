//! Shared data models for the relay

mod auth;
mod device;

pub use auth::*;
pub use device::*;

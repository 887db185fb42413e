//! Integration tests for the fleet relay
//!
//! These tests run a real [`fleet_relay::RelayService`] on loopback between
//! a fake tracking backend (a tokio-tungstenite server) and raw TCP viewers
//! that speak the frame protocol through `fleet-frame`.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p fleet-tests
//! ```
//!
//! # Test Structure
//!
//! - `relay_e2e_test.rs` - handshake, tenant filtering, control frames,
//!   upstream reconnect policy and shutdown

// This crate only contains tests, no library code

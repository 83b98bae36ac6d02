//! End-to-end test utilities for the Backhaul relay
//!
//! Runs the real session lifecycle against a loopback "relay host" whose public
//! port is a local TCP listener, so tests need no SSH server.

pub mod harness;
pub mod local_service;

pub use harness::{wait_until, TestRelayHost, TestTransport, TestTunnel};
pub use local_service::{ServedConnection, ServiceBehavior, TestLocalService};

//! Test utilities for mqtt-shell.
//!
//! Provides an in-memory broker hub implementing the broker adapter trait,
//! allowing protocol logic to be exercised end-to-end without a real MQTT
//! broker.

mod mock_broker;

pub use mock_broker::{MockBroker, MockHub};

//! Integration test entry point for loopbridge-node.
//!
//! Run with: cargo test --test integration -- --test-threads=1

mod harness;
mod client_server;
mod firewall;
mod lifecycle;
mod relay;

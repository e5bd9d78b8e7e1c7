//! Integration test entry point for glink-node.
//!
//! Nodes run in-process on loopback with multicast discovery disabled;
//! announcements are handed to each node directly.

mod harness;
mod handshake;
mod reconciliation;

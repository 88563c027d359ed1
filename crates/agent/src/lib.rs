//! Auto-bootstrap agent library.
//!
//! Implements the one-shot bootstrap decision for a control plane node on an
//! immutable-OS cluster: discover peers on the local subnet, wait for quorum,
//! deterministically elect a leader without exchanging votes, and issue the
//! cluster bootstrap RPC against the local management socket at most once.
//!
//! The `talos-auto-bootstrap` binary is a thin driver over this library;
//! integration tests exercise the components directly.

#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod discovery;
pub mod election;
pub mod machined;
pub mod shutdown;

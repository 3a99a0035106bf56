//! Method-offloading runtime library.
//!
//! This crate provides the device-side engine (`engine`, `pool`, `dispatch`,
//! `codec`, `connection`), the typed capability contract for offloadable
//! receivers (`registry`, `invocation`), the wire vocabulary shared with the
//! peer (`protocol`), and a reference peer (`peer`, `class_cache`) used by the
//! `offload` CLI and the `offload-peer` launcher.
//!
//! Invariants:
//! - every submitted task receives exactly one outcome
//! - a channel carries at most one in-flight request and registers once
//! - remote failures never reach the caller; they fall back to local execution
//! - HYBRID verdicts fail explicitly as unsupported

pub mod app;
pub mod broker;
pub mod class_cache;
pub mod codec;
pub mod config;
pub mod connection;
pub mod demo;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod invocation;
pub mod link;
pub mod local;
pub mod netquality;
pub mod oracle;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod trace;

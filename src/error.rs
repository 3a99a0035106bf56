//! Typed errors for the protocol and connection seams.
//!
//! Application edges (config, engine start, binaries) wrap these in
//! `anyhow::Error`; the dispatcher matches on them to decide on fallback.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("string of {0} bytes does not fit a u16 length prefix")]
    StringTooLong(usize),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("malformed frame body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected opcode 0x{got:02x} (expected {expected})")]
    UnexpectedOpcode { got: u8, expected: &'static str },

    #[error("unsupported replica count {0} (only 1 is supported)")]
    ReplicaCount(u32),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("peer {address} is not reachable on either port: secure={secure:?}, plaintext={plaintext}")]
    Unreachable {
        address: String,
        secure: Option<String>,
        plaintext: io::Error,
    },

    #[error("invalid peer address '{0}'")]
    Address(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read PEM material from '{path}': {message}")]
    Pem { path: PathBuf, message: String },

    #[error("no certificates found in '{0}'")]
    NoCertificates(PathBuf),

    #[error("invalid TLS server name '{0}'")]
    ServerName(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("channel is {0:?}; registration needs a freshly connected channel")]
    InvalidState(crate::connection::ChannelState),

    #[error("registration protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("failed to stream application payload: {0}")]
    Upload(#[source] io::Error),

    #[error("application payload ended after {sent} of {expected} bytes")]
    ShortPayload { sent: u64, expected: u64 },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("receiver state does not match type '{type_name}': {source}")]
    Shape {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("receiver rejected state: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("channel is not ready for offload requests")]
    ChannelNotReady,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("failed to snapshot receiver: {0}")]
    Snapshot(#[source] StateError),

    #[error("failed to apply remote state to receiver: {0}")]
    ApplyState(#[source] StateError),
}

#[derive(Debug, Error)]
pub enum ClassLoadError {
    #[error("class '{0}' not found in platform types or application directory")]
    NotFound(String),

    #[error("failed to read bytes of class '{name}' from '{path}': {source}")]
    Io {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid class name '{0}'")]
    InvalidName(String),
}

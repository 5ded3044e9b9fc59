//! Error taxonomy for the ADB protocol engine (spec §7).

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AdbError>;

#[derive(Error, Debug)]
pub enum AdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    TransportClosed,

    #[error("bad magic: command {command:#x} vs magic {magic:#x}")]
    BadMagic { command: u32, magic: u32 },

    #[error("bad checksum: expected {expected:#x}, got {actual:#x}")]
    BadChecksum { expected: u32, actual: u32 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("unknown command code {0:#x}")]
    UnknownCommand(u32),

    #[error("protocol version mismatch: host {host_version:#x}, peer {peer_version:#x}")]
    ProtocolVersionMismatch { host_version: u32, peer_version: u32 },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("service rejected: {0}")]
    ServiceRejected(String),

    #[error("stream closed: {0}")]
    StreamClosed(String),

    #[error("payload too large: {len} bytes exceeds max_payload {max_payload}")]
    PayloadTooLarge { len: usize, max_payload: u32 },

    #[error("sync failure: {0}")]
    SyncFailure(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

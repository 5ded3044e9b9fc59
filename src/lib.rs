//! `adb_core`: a host-side Android Debug Bridge protocol engine -- wire
//! framing, the CNXN/AUTH handshake, stream multiplexing and the sync
//! file-transfer sub-protocol, over either a TCP or USB transport.
//!
//! CLI parsing, device-discovery mechanics and higher-level commands live
//! outside this crate (see the `adb-cli` binary for a thin example).

pub mod codec;
pub mod connection;
pub mod error;
pub mod mux;
pub mod service;
pub mod signer;
pub mod sync;
pub mod transport;

pub mod util {
    pub mod config;
    pub mod logging;
}

pub use codec::Command;
pub use connection::{handshake, Session};
pub use error::{AdbError, Result};
pub use mux::{Stream, StreamMux};
pub use service::ServiceClient;
pub use signer::{RsaSigner, Signer};
pub use transport::Transport;

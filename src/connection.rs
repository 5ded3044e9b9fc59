//! Connection handshake and authentication (spec §4.D).
//!
//! Drives `INIT -> SENT_CNXN -> (AUTH loop) -> ONLINE` and returns the
//! negotiated `Session`. The reader/writer discipline mirrors the teacher's
//! `AdbConnection::handshake` (`adb.rs`), generalized from "accept CNXN or a
//! fixed Xiaomi sideload banner" to the real AUTH/TOKEN/SIGNATURE/
//! RSAPUBLICKEY exchange of spec.md §4.D.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::codec::{self, auth_type, Command, CHECKSUM_DISABLED_VERSION};
use crate::error::{AdbError, Result};
use crate::signer::{Signer, TOKEN_LEN};
use crate::transport::Transport;

/// Host's advertised protocol version and max payload, sent in the initial
/// CNXN (spec §4.D step 1).
pub const HOST_VERSION: u32 = 0x0100_0001;
pub const HOST_MAX_PAYLOAD: u32 = 1 << 20;

/// Minimum payload the negotiated max is clamped to (spec §3).
const MIN_MAX_PAYLOAD: u32 = 4096;
const MAX_MAX_PAYLOAD: u32 = 1 << 20;

/// The negotiated state of an online connection (spec §3 "Session").
#[derive(Debug, Clone)]
pub struct Session {
    pub protocol_version: u32,
    pub max_payload: u32,
    pub banner: String,
    pub system_state: String,
    pub features: HashSet<String>,
    pub system_identity: String,
    pub checksum_enabled: bool,
}

impl Session {
    fn from_banner(protocol_version: u32, max_payload: u32, banner: &str) -> Self {
        let max_payload = max_payload.clamp(MIN_MAX_PAYLOAD, MAX_MAX_PAYLOAD);
        let (system_state, rest) = banner.split_once("::").unwrap_or((banner, ""));
        let mut features = HashSet::new();
        let mut identity_parts = Vec::new();
        for kv in rest.split(';') {
            if kv.is_empty() {
                continue;
            }
            if let Some(list) = kv.strip_prefix("features=") {
                features.extend(list.split(',').filter(|s| !s.is_empty()).map(str::to_string));
            } else {
                identity_parts.push(kv.to_string());
            }
        }
        Session {
            protocol_version,
            max_payload,
            banner: banner.to_string(),
            system_state: system_state.to_string(),
            features,
            system_identity: identity_parts.join(";"),
            checksum_enabled: protocol_version < CHECKSUM_DISABLED_VERSION,
        }
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains(name)
    }
}

fn host_banner(features: &[&str]) -> Vec<u8> {
    let mut s = String::from("host::features=");
    s.push_str(&features.join(","));
    s.push('\0');
    s.into_bytes()
}

/// Drive the CNXN/AUTH handshake over `transport`, trying each signer in
/// order when challenged, and return the resulting `Session`.
///
/// `deadline` bounds the whole exchange, matching spec §5's "awaiting CNXN
/// after AUTH" suspension point.
pub fn handshake(
    transport: &mut Transport,
    signers: &[Arc<dyn Signer>],
    features: &[&str],
    deadline: Duration,
) -> Result<Session> {
    let start = Instant::now();
    let banner = host_banner(features);
    codec::encode_and_write(transport, Command::CNXN, HOST_VERSION, HOST_MAX_PAYLOAD, &banner, false, 0)?;

    let mut signer_index = 0usize;
    loop {
        if start.elapsed() > deadline {
            return Err(AdbError::Timeout);
        }
        let (header, payload) = codec::read_message(transport, false)?;
        match header.command()? {
            Command::CNXN => {
                let banner = String::from_utf8_lossy(&payload).trim_end_matches('\0').to_string();
                // Negotiated version is the lower of the two advertised versions.
                let negotiated_version = header.arg0.min(HOST_VERSION);
                if negotiated_version & 0xFF00_0000 != HOST_VERSION & 0xFF00_0000 {
                    return Err(AdbError::ProtocolVersionMismatch {
                        host_version: HOST_VERSION,
                        peer_version: header.arg0,
                    });
                }
                return Ok(Session::from_banner(negotiated_version, header.arg1, &banner));
            }
            Command::AUTH if header.arg0 == auth_type::TOKEN => {
                if payload.len() != TOKEN_LEN {
                    return Err(AdbError::InvalidResponse(format!(
                        "AUTH token length {} != {}",
                        payload.len(),
                        TOKEN_LEN
                    )));
                }
                let mut token = [0u8; TOKEN_LEN];
                token.copy_from_slice(&payload);

                if signer_index < signers.len() {
                    let signature = signers[signer_index].sign(&token)?;
                    signer_index += 1;
                    codec::encode_and_write(transport, Command::AUTH, auth_type::SIGNATURE, 0, &signature, false, 0)?;
                } else if let Some(last) = signers.last() {
                    // Exhausted known keys: offer the public key and wait for
                    // operator approval on-device (spec §4.D step 3).
                    let mut blob = last.public_key_blob()?;
                    blob.push(0);
                    codec::encode_and_write(
                        transport,
                        Command::AUTH,
                        auth_type::RSAPUBLICKEY,
                        0,
                        &blob,
                        false,
                        0,
                    )?;
                } else {
                    return Err(AdbError::AuthenticationFailed("no signers configured".into()));
                }
            }
            Command::AUTH => {
                // Unexpected AUTH sub-type; keep waiting within the deadline.
            }
            Command::STLS => {
                return Err(AdbError::UnsupportedOperation("STLS (TLS upgrade) is not supported".into()));
            }
            _ => {
                // Ignore stray frames before the session is online.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::RsaSigner;
    use crate::transport::test_support::tcp_pair;
    use std::thread;

    fn test_signer() -> Arc<dyn Signer> {
        use rsa::pkcs8::EncodePrivateKey;
        use rsa::RsaPrivateKey;
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let pem = key.to_pkcs8_pem(pkcs8::LineEnding::LF).unwrap().to_string();
        RsaSigner::from_pkcs8_pem(&pem, "test@host").unwrap().into_arc()
    }

    #[test]
    fn s1_handshake_no_auth() {
        let (mut host, mut device) = tcp_pair();
        let device_thread = thread::spawn(move || {
            let (header, _payload) = codec::read_message(&mut device, false).unwrap();
            assert_eq!(header.command, Command::CNXN.as_u32());
            codec::encode_and_write(
                &mut device,
                Command::CNXN,
                HOST_VERSION,
                0x0010_0000,
                b"device::ro.product.name=generic;features=shell_v2,cmd\0",
                false,
                0,
            )
            .unwrap();
        });
        let session = handshake(&mut host, &[], &["shell_v2"], Duration::from_secs(2)).unwrap();
        device_thread.join().unwrap();
        assert_eq!(session.max_payload, 0x0010_0000);
        assert!(session.has_feature("shell_v2"));
        assert!(session.has_feature("cmd"));
        assert_eq!(session.system_state, "device");
    }

    #[test]
    fn s2_auth_with_one_key() {
        let (mut host, mut device) = tcp_pair();
        let signer = test_signer();
        let device_thread = thread::spawn(move || {
            let (_header, _payload) = codec::read_message(&mut device, false).unwrap();
            let token = [9u8; TOKEN_LEN];
            codec::encode_and_write(&mut device, Command::AUTH, auth_type::TOKEN, 0, &token, false, 0).unwrap();
            let (header, _sig) = codec::read_message(&mut device, false).unwrap();
            assert_eq!(header.command, Command::AUTH.as_u32());
            assert_eq!(header.arg0, auth_type::SIGNATURE);
            codec::encode_and_write(&mut device, Command::CNXN, HOST_VERSION, 0x10000, b"device::\0", false, 0)
                .unwrap();
        });
        let session = handshake(&mut host, &[signer], &["shell_v2"], Duration::from_secs(2)).unwrap();
        device_thread.join().unwrap();
        assert_eq!(session.system_state, "device");
    }

    #[test]
    fn s6_bad_magic_ends_session() {
        let (mut host, mut device) = tcp_pair();
        let device_thread = thread::spawn(move || {
            let (_h, _p) = codec::read_message(&mut device, false).unwrap();
            // Corrupt magic directly on the wire.
            let mut header = codec::Header::new(Command::CNXN, 0, 0, &[], false);
            // Force an invalid magic (spec S6).
            header.magic = header.command;
            device.write_all(&header.encode()).unwrap();
        });
        let err = handshake(&mut host, &[], &["shell_v2"], Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, AdbError::BadMagic { .. }));
        device_thread.join().unwrap();
    }
}

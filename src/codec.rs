//! Wire codec (spec §4.A): the 24-byte ADB message header, payload checksum
//! gating and the command code enum.
//!
//! All integers are little-endian, matching the teacher's `adb.rs`, which
//! packed/unpacked the same six `u32` fields by hand with `byteorder`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{AdbError, Result};
use crate::transport::{ReadExact, WriteAll};

pub const HEADER_LEN: usize = 24;

/// Protocol version at and above which checksums are disabled (spec §3, §9).
pub const CHECKSUM_DISABLED_VERSION: u32 = 0x0100_0001;

const fn pack_cmd(b: [u8; 4]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16) | ((b[3] as u32) << 24)
}

/// ADB command codes, replacing the teacher's raw `u32` constants with a
/// typed enum so an unrecognized code is rejected at decode time rather than
/// silently falling through a wildcard match.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    CNXN = pack_cmd(*b"CNXN"),
    AUTH = pack_cmd(*b"AUTH"),
    STLS = pack_cmd(*b"STLS"),
    OPEN = pack_cmd(*b"OPEN"),
    OKAY = pack_cmd(*b"OKAY"),
    CLSE = pack_cmd(*b"CLSE"),
    WRTE = pack_cmd(*b"WRTE"),
    SYNC = pack_cmd(*b"SYNC"),
}

impl Command {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Command {
    type Error = AdbError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            v if v == Command::CNXN as u32 => Command::CNXN,
            v if v == Command::AUTH as u32 => Command::AUTH,
            v if v == Command::STLS as u32 => Command::STLS,
            v if v == Command::OPEN as u32 => Command::OPEN,
            v if v == Command::OKAY as u32 => Command::OKAY,
            v if v == Command::CLSE as u32 => Command::CLSE,
            v if v == Command::WRTE as u32 => Command::WRTE,
            v if v == Command::SYNC as u32 => Command::SYNC,
            other => return Err(AdbError::UnknownCommand(other)),
        })
    }
}

/// AUTH message sub-types (arg0 of an AUTH packet).
pub mod auth_type {
    pub const TOKEN: u32 = 1;
    pub const SIGNATURE: u32 = 2;
    pub const RSAPUBLICKEY: u32 = 3;
}

#[derive(Debug, Clone)]
pub struct Header {
    pub command: u32,
    pub arg0: u32,
    pub arg1: u32,
    pub length: u32,
    pub checksum: u32,
    pub magic: u32,
}

impl Header {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: &[u8], checksum_enabled: bool) -> Self {
        let command = command.as_u32();
        Header {
            command,
            arg0,
            arg1,
            length: payload.len() as u32,
            checksum: if checksum_enabled { checksum(payload) } else { 0 },
            magic: command ^ 0xFFFF_FFFF,
        }
    }

    pub fn command(&self) -> Result<Command> {
        Command::try_from(self.command)
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], self.command);
        LittleEndian::write_u32(&mut buf[4..8], self.arg0);
        LittleEndian::write_u32(&mut buf[8..12], self.arg1);
        LittleEndian::write_u32(&mut buf[12..16], self.length);
        LittleEndian::write_u32(&mut buf[16..20], self.checksum);
        LittleEndian::write_u32(&mut buf[20..24], self.magic);
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        Header {
            command: LittleEndian::read_u32(&buf[0..4]),
            arg0: LittleEndian::read_u32(&buf[4..8]),
            arg1: LittleEndian::read_u32(&buf[8..12]),
            length: LittleEndian::read_u32(&buf[12..16]),
            checksum: LittleEndian::read_u32(&buf[16..20]),
            magic: LittleEndian::read_u32(&buf[20..24]),
        }
    }
}

pub fn checksum(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Encode a message and write it to the transport (spec §4.A).
///
/// `max_payload` of `0` disables the size check (used before negotiation).
pub fn encode_and_write(
    transport: &mut impl WriteAll,
    command: Command,
    arg0: u32,
    arg1: u32,
    payload: &[u8],
    checksum_enabled: bool,
    max_payload: u32,
) -> Result<()> {
    if max_payload != 0 && payload.len() as u32 > max_payload {
        return Err(AdbError::PayloadTooLarge {
            len: payload.len(),
            max_payload,
        });
    }
    let header = Header::new(command, arg0, arg1, payload, checksum_enabled);
    transport.write_all(&header.encode())?;
    if !payload.is_empty() {
        transport.write_all(payload)?;
    }
    Ok(())
}

/// Read exactly one message from the transport (spec §4.A).
pub fn read_message(transport: &mut impl ReadExact, checksum_required: bool) -> Result<(Header, Vec<u8>)> {
    let mut raw = [0u8; HEADER_LEN];
    transport.read_exact(&mut raw)?;
    let header = Header::decode(&raw);
    if header.magic != (header.command ^ 0xFFFF_FFFF) {
        return Err(AdbError::BadMagic {
            command: header.command,
            magic: header.magic,
        });
    }
    let mut payload = vec![0u8; header.length as usize];
    if !payload.is_empty() {
        transport.read_exact(&mut payload)?;
    }
    if checksum_required {
        let expected = checksum(&payload);
        if header.checksum != expected {
            return Err(AdbError::BadChecksum {
                expected,
                actual: header.checksum,
            });
        }
    }
    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::tcp_pair;

    #[test]
    fn round_trip_preserves_header_and_payload() {
        let (mut a, mut b) = tcp_pair();
        let payload = b"hello world".to_vec();
        encode_and_write(&mut a, Command::WRTE, 1, 2, &payload, true, 0).unwrap();
        let (header, got) = read_message(&mut b, true).unwrap();
        assert_eq!(header.command, Command::WRTE.as_u32());
        assert_eq!(header.magic, header.command ^ 0xFFFF_FFFF);
        assert_eq!(got, payload);
    }

    #[test]
    fn checksum_disabled_writes_zero_and_skips_verification() {
        let (mut a, mut b) = tcp_pair();
        let payload = b"payload".to_vec();
        encode_and_write(&mut a, Command::WRTE, 0, 0, &payload, false, 0).unwrap();
        let (header, got) = read_message(&mut b, false).unwrap();
        assert_eq!(header.checksum, 0);
        assert_eq!(got, payload);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (mut a, mut b) = tcp_pair();
        let mut header = Header::new(Command::CNXN, 0, 0, &[], false);
        header.magic = header.command; // corrupt
        let buf = header.encode();
        a.write_all(&buf).unwrap();
        let err = read_message(&mut b, false).unwrap_err();
        assert!(matches!(err, AdbError::BadMagic { .. }));
    }

    #[test]
    fn payload_over_max_is_rejected() {
        let (mut a, _b) = tcp_pair();
        let payload = vec![0u8; 10];
        let err = encode_and_write(&mut a, Command::WRTE, 0, 0, &payload, false, 4).unwrap_err();
        assert!(matches!(err, AdbError::PayloadTooLarge { .. }));
    }
}

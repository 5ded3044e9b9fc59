//! Sync sub-protocol (spec §4.F): `push`/`pull`/`stat`/`list`/`quit` over an
//! already-open `sync:` stream.
//!
//! Mirrors the chunking/progress-accounting shape of the teacher's
//! `sideload_zip` (`src/sideload.rs`: read a file in fixed-size pieces,
//! report a running total, await a peer acknowledgement) but speaks the
//! real inner `SEND/RECV/STAT/LIST/DENT/DATA/DONE/OKAY/FAIL/QUIT` frames
//! instead of the Xiaomi `sideload-host:` text protocol.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{AdbError, Result};
use crate::mux::Stream;

/// Sync DATA chunks are capped at 64 KiB regardless of the outer session's
/// negotiated `max_payload` (spec §4.F / §5).
pub const SYNC_MAX_CHUNK: usize = 64 * 1024;

const SEND: [u8; 4] = *b"SEND";
const RECV: [u8; 4] = *b"RECV";
const STAT: [u8; 4] = *b"STAT";
const LIST: [u8; 4] = *b"LIST";
const DENT: [u8; 4] = *b"DENT";
const DATA: [u8; 4] = *b"DATA";
const DONE: [u8; 4] = *b"DONE";
const OKAY: [u8; 4] = *b"OKAY";
const FAIL: [u8; 4] = *b"FAIL";
const QUIT: [u8; 4] = *b"QUIT";

/// A directory entry returned by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

/// File metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

/// Buffers inbound stream chunks so sync frames, which don't align with
/// `Stream::read`'s arbitrary chunk boundaries, can be read a fixed number
/// of bytes at a time.
struct FrameReader<'a> {
    stream: &'a Stream,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(stream: &'a Stream) -> Self {
        FrameReader {
            stream,
            buf: Vec::new(),
            pos: 0,
        }
    }

    fn read_exact(&mut self, out: &mut [u8], until: Instant) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.pos < self.buf.len() {
                let n = (self.buf.len() - self.pos).min(out.len() - filled);
                out[filled..filled + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                filled += n;
                continue;
            }
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AdbError::Timeout);
            }
            match self.stream.read(remaining)? {
                Some(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                None => {
                    return Err(AdbError::SyncFailure(
                        "stream closed mid-frame".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Read an 8-byte `[id:4][value:4]` inner header.
    fn read_header(&mut self, until: Instant) -> Result<([u8; 4], u32)> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw, until)?;
        let mut id = [0u8; 4];
        id.copy_from_slice(&raw[0..4]);
        Ok((id, LittleEndian::read_u32(&raw[4..8])))
    }

    fn read_fail_message(&mut self, len: u32, until: Instant) -> Result<AdbError> {
        let mut msg = vec![0u8; len as usize];
        self.read_exact(&mut msg, until)?;
        Ok(AdbError::SyncFailure(String::from_utf8_lossy(&msg).into_owned()))
    }
}

fn write_header(stream: &Stream, id: [u8; 4], value: u32, until: Instant) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&id);
    LittleEndian::write_u32(&mut buf[4..8], value);
    stream.write(&buf, until.saturating_duration_since(Instant::now()))
}

fn write_bytes(stream: &Stream, data: &[u8], until: Instant) -> Result<()> {
    stream.write(data, until.saturating_duration_since(Instant::now()))
}

/// Push raw `data` to `remote_path` on the peer with the given octal `mode`
/// and `mtime` (seconds since epoch). Lower-level than `push`: takes bytes
/// directly so tests and in-memory callers don't need a real file.
pub fn push_data(stream: &Stream, remote_path: &str, mode: u32, data: &[u8], mtime: u32, deadline: Duration) -> Result<()> {
    let until = Instant::now() + deadline;
    let spec = format!("{remote_path},0{mode:o}");
    write_header(stream, SEND, spec.len() as u32, until)?;
    write_bytes(stream, spec.as_bytes(), until)?;

    let pb = push_progress_bar(data.len() as u64);
    for chunk in data.chunks(SYNC_MAX_CHUNK) {
        write_header(stream, DATA, chunk.len() as u32, until)?;
        write_bytes(stream, chunk, until)?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();
    write_header(stream, DONE, mtime, until)?;

    let mut reader = FrameReader::new(stream);
    let (id, value) = reader.read_header(until)?;
    if id == OKAY {
        Ok(())
    } else if id == FAIL {
        Err(reader.read_fail_message(value, until)?)
    } else {
        Err(AdbError::SyncFailure(format!(
            "unexpected reply to SEND: {:?}",
            String::from_utf8_lossy(&id)
        )))
    }
}

fn push_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%)")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb
}

/// Push the contents of `local_path` to `remote_path`, using the local
/// file's mtime and `mode`.
pub fn push(stream: &Stream, local_path: &Path, remote_path: &str, mode: u32, deadline: Duration) -> Result<()> {
    let data = fs::read(local_path)?;
    let mtime = fs::metadata(local_path)?
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0);
    push_data(stream, remote_path, mode, &data, mtime, deadline)
}

/// Pull `remote_path` from the peer, returning its raw bytes.
pub fn pull_data(stream: &Stream, remote_path: &str, deadline: Duration) -> Result<Vec<u8>> {
    let until = Instant::now() + deadline;
    write_header(stream, RECV, remote_path.len() as u32, until)?;
    write_bytes(stream, remote_path.as_bytes(), until)?;

    let mut reader = FrameReader::new(stream);
    let mut out = Vec::new();
    loop {
        let (id, value) = reader.read_header(until)?;
        if id == DATA {
            let start = out.len();
            out.resize(start + value as usize, 0);
            reader.read_exact(&mut out[start..], until)?;
        } else if id == DONE {
            return Ok(out);
        } else if id == FAIL {
            return Err(reader.read_fail_message(value, until)?);
        } else {
            return Err(AdbError::SyncFailure(format!(
                "unexpected reply to RECV: {:?}",
                String::from_utf8_lossy(&id)
            )));
        }
    }
}

/// Pull `remote_path` from the peer and write it to `local_path`.
pub fn pull(stream: &Stream, remote_path: &str, local_path: &Path, deadline: Duration) -> Result<()> {
    let data = pull_data(stream, remote_path, deadline)?;
    fs::write(local_path, data)?;
    Ok(())
}

/// Query mode/size/mtime for `remote_path`.
pub fn stat(stream: &Stream, remote_path: &str, deadline: Duration) -> Result<Stat> {
    let until = Instant::now() + deadline;
    write_header(stream, STAT, remote_path.len() as u32, until)?;
    write_bytes(stream, remote_path.as_bytes(), until)?;

    let mut reader = FrameReader::new(stream);
    // Reply is id("STAT") + mode + size + time, 16 bytes total -- wider than
    // the generic 8-byte frame header used elsewhere.
    let mut raw = [0u8; 16];
    reader.read_exact(&mut raw, until)?;
    if &raw[0..4] != STAT {
        return Err(AdbError::SyncFailure(format!(
            "unexpected reply to STAT: {:?}",
            String::from_utf8_lossy(&raw[0..4])
        )));
    }
    Ok(Stat {
        mode: LittleEndian::read_u32(&raw[4..8]),
        size: LittleEndian::read_u32(&raw[8..12]),
        mtime: LittleEndian::read_u32(&raw[12..16]),
    })
}

/// List the contents of `remote_path` (a directory).
pub fn list(stream: &Stream, remote_path: &str, deadline: Duration) -> Result<Vec<DirEntry>> {
    let until = Instant::now() + deadline;
    write_header(stream, LIST, remote_path.len() as u32, until)?;
    write_bytes(stream, remote_path.as_bytes(), until)?;

    let mut reader = FrameReader::new(stream);
    let mut entries = Vec::new();
    loop {
        let mut raw = [0u8; 20];
        reader.read_exact(&mut raw, until)?;
        let id = &raw[0..4];
        if id == DONE {
            return Ok(entries);
        }
        if id != DENT {
            return Err(AdbError::SyncFailure(format!(
                "unexpected reply to LIST: {:?}",
                String::from_utf8_lossy(id)
            )));
        }
        let mode = LittleEndian::read_u32(&raw[4..8]);
        let size = LittleEndian::read_u32(&raw[8..12]);
        let mtime = LittleEndian::read_u32(&raw[12..16]);
        let namelen = LittleEndian::read_u32(&raw[16..20]) as usize;
        let mut name = vec![0u8; namelen];
        reader.read_exact(&mut name, until)?;
        entries.push(DirEntry {
            name: String::from_utf8_lossy(&name).into_owned(),
            mode,
            size,
            mtime,
        });
    }
}

/// End the sync session (spec §4.F). Does not wait for a reply.
pub fn quit(stream: &Stream, deadline: Duration) -> Result<()> {
    let until = Instant::now() + deadline;
    write_header(stream, QUIT, 0, until)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Command};
    use crate::connection::Session;
    use crate::mux::StreamMux;
    use crate::transport::test_support::tcp_pair;
    use std::collections::HashSet;
    use std::thread;

    fn test_session() -> Session {
        Session {
            protocol_version: crate::connection::HOST_VERSION,
            max_payload: 1 << 16,
            banner: String::new(),
            system_state: "device".into(),
            features: HashSet::new(),
            system_identity: String::new(),
            checksum_enabled: false,
        }
    }

    const DEVICE_REMOTE_ID: u32 = 42;

    /// Spawn a mux against one end of a loopback pair and open a stream,
    /// after replying OKAY to the OPEN from a peer-simulating thread.
    fn open_stream_pair() -> (Stream, thread::JoinHandle<(crate::transport::Transport, u32)>) {
        let (host_transport, mut device) = tcp_pair();
        let mux = StreamMux::start(host_transport, test_session());
        let device_thread = thread::spawn(move || {
            let (header, _payload) = codec::read_message(&mut device, false).unwrap();
            assert_eq!(header.command, Command::OPEN.as_u32());
            let local_id = header.arg0;
            codec::encode_and_write(&mut device, Command::OKAY, DEVICE_REMOTE_ID, local_id, &[], false, 0).unwrap();
            (device, local_id)
        });
        let stream = mux.open("sync:", Duration::from_secs(2)).unwrap();
        (stream, device_thread)
    }

    #[test]
    fn s4_push_large_file_in_chunks() {
        let (stream, device_thread) = open_stream_pair();
        let payload_len = 70_000usize;
        let data: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();

        let pusher = thread::spawn(move || {
            push_data(&stream, "/sdcard/x", 0o644, &data, 1_700_000_000, Duration::from_secs(5))
        });

        let (mut dev, local_id) = device_thread.join().unwrap();
        // `push_data` sends the SEND header and the path as two separate
        // outer WRTE frames (one per `Stream::write` call), same as every
        // DATA chunk below. Each one needs an OKAY ack before the host's
        // next `Stream::write` is allowed to proceed (spec §4.E flow
        // control: at most one unacknowledged WRTE per stream).
        let (id, value) = recv_frame(&mut dev, local_id);
        assert_eq!(&id, b"SEND");
        let path = recv_payload(&mut dev, local_id, value as usize);
        assert_eq!(String::from_utf8(path).unwrap(), "/sdcard/x,0644");

        let mut total = 0usize;
        loop {
            let (id, value) = recv_frame(&mut dev, local_id);
            if &id == b"DONE" {
                assert_eq!(value, 1_700_000_000);
                break;
            }
            assert_eq!(&id, b"DATA");
            let chunk = recv_payload(&mut dev, local_id, value as usize);
            total += chunk.len();
        }
        assert_eq!(total, payload_len);
        write_inner(&mut dev, local_id, b"OKAY", 0);

        pusher.join().unwrap().unwrap();
    }

    #[test]
    fn s5_pull_missing_file_reports_fail() {
        let (stream, device_thread) = open_stream_pair();
        let puller = thread::spawn(move || pull_data(&stream, "/sdcard/missing", Duration::from_secs(5)));

        let (mut dev, local_id) = device_thread.join().unwrap();
        let (id, value) = recv_frame(&mut dev, local_id);
        assert_eq!(&id, b"RECV");
        let path = recv_payload(&mut dev, local_id, value as usize);
        assert_eq!(String::from_utf8(path).unwrap(), "/sdcard/missing");

        let msg = b"No such file";
        write_inner(&mut dev, local_id, b"FAIL", msg.len() as u32);
        codec::encode_and_write(&mut dev, Command::WRTE, DEVICE_REMOTE_ID, local_id, msg, false, 0).unwrap();

        let err = puller.join().unwrap().unwrap_err();
        match err {
            AdbError::SyncFailure(m) => assert_eq!(m, "No such file"),
            other => panic!("expected SyncFailure, got {other:?}"),
        }
    }

    /// `push`/`pull` (the `Path`-taking wrappers, not the in-memory
    /// `push_data`/`pull_data` exercised by S4/S5) round-tripped through a
    /// real file on disk.
    #[test]
    fn pushes_and_pulls_a_real_file() {
        use std::io::Write as _;

        let content = b"hello from a real file on disk\n".to_vec();

        let mut src = tempfile::NamedTempFile::new().unwrap();
        src.write_all(&content).unwrap();
        let src_path = src.path().to_path_buf();

        let (stream, device_thread) = open_stream_pair();
        let pusher = thread::spawn(move || push(&stream, &src_path, "/sdcard/real", 0o644, Duration::from_secs(5)));

        let (mut dev, local_id) = device_thread.join().unwrap();
        let (id, value) = recv_frame(&mut dev, local_id);
        assert_eq!(&id, b"SEND");
        let path = recv_payload(&mut dev, local_id, value as usize);
        assert_eq!(String::from_utf8(path).unwrap(), "/sdcard/real,0644");

        let mut total = 0usize;
        loop {
            let (id, value) = recv_frame(&mut dev, local_id);
            if &id == b"DONE" {
                break;
            }
            assert_eq!(&id, b"DATA");
            let chunk = recv_payload(&mut dev, local_id, value as usize);
            total += chunk.len();
        }
        assert_eq!(total, content.len());
        write_inner(&mut dev, local_id, b"OKAY", 0);
        pusher.join().unwrap().unwrap();

        let (stream, device_thread) = open_stream_pair();
        let dest_dir = tempfile::tempdir().unwrap();
        let dst_path = dest_dir.path().join("pulled.bin");
        let puller_dst = dst_path.clone();
        let puller = thread::spawn(move || pull(&stream, "/sdcard/real", &puller_dst, Duration::from_secs(5)));

        let (mut dev, local_id) = device_thread.join().unwrap();
        let (id, value) = recv_frame(&mut dev, local_id);
        assert_eq!(&id, b"RECV");
        let path = recv_payload(&mut dev, local_id, value as usize);
        assert_eq!(String::from_utf8(path).unwrap(), "/sdcard/real");

        write_inner(&mut dev, local_id, b"DATA", content.len() as u32);
        codec::encode_and_write(&mut dev, Command::WRTE, DEVICE_REMOTE_ID, local_id, &content, false, 0).unwrap();
        write_inner(&mut dev, local_id, b"DONE", 0);
        puller.join().unwrap().unwrap();

        assert_eq!(fs::read(&dst_path).unwrap(), content);
    }

    /// Ack one inbound WRTE from the host so its blocked `Stream::write`
    /// (waiting for the permit) can proceed.
    fn ack(transport: &mut crate::transport::Transport, local_id: u32) {
        codec::encode_and_write(transport, Command::OKAY, DEVICE_REMOTE_ID, local_id, &[], false, 0).unwrap();
    }

    /// Receive one outer WRTE frame from the host, ack it, and interpret its
    /// payload as an 8-byte `[id:4][value:4]` inner header.
    fn recv_frame(transport: &mut crate::transport::Transport, local_id: u32) -> ([u8; 4], u32) {
        let (_header, payload) = codec::read_message(transport, false).unwrap();
        ack(transport, local_id);
        let mut id = [0u8; 4];
        id.copy_from_slice(&payload[0..4]);
        (id, LittleEndian::read_u32(&payload[4..8]))
    }

    /// Receive one outer WRTE frame from the host, ack it, and return its
    /// raw inner-protocol body (a path or a DATA chunk).
    fn recv_payload(transport: &mut crate::transport::Transport, local_id: u32, len: usize) -> Vec<u8> {
        let (_header, payload) = codec::read_message(transport, false).unwrap();
        ack(transport, local_id);
        assert_eq!(payload.len(), len);
        payload
    }

    fn write_inner(transport: &mut crate::transport::Transport, local_id: u32, id: &[u8; 4], value: u32) {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(id);
        LittleEndian::write_u32(&mut buf[4..8], value);
        codec::encode_and_write(transport, Command::WRTE, DEVICE_REMOTE_ID, local_id, &buf, false, 0).unwrap();
    }
}

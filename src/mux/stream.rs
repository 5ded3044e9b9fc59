//! `Stream`: a caller's handle onto one multiplexed logical channel (spec
//! §3 "Stream", §4.E). Holds only its id and an `Arc<StreamMux>`
//! back-reference — the multiplexer, not the stream, owns all shared state
//! (spec §9 arena-ownership note).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::codec::Command;
use crate::error::{AdbError, Result};

use super::{StreamMux, StreamSignal};

pub struct Stream {
    mux: Arc<StreamMux>,
    local_id: u32,
    remote_id: Mutex<u32>,
    control_rx: Mutex<mpsc::Receiver<StreamSignal>>,
    data_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    write_lock: Mutex<()>,
    local_closed: AtomicBool,
}

impl Stream {
    pub(super) fn new(
        mux: Arc<StreamMux>,
        local_id: u32,
        control_rx: mpsc::Receiver<StreamSignal>,
        data_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Stream {
            mux,
            local_id,
            remote_id: Mutex::new(0),
            control_rx: Mutex::new(control_rx),
            data_rx: Mutex::new(data_rx),
            write_lock: Mutex::new(()),
            local_closed: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    pub fn remote_id(&self) -> u32 {
        *self.remote_id.lock().unwrap()
    }

    pub(super) fn wait_opened(&self, deadline: Duration) -> Result<()> {
        let rx = self.control_rx.lock().unwrap();
        match rx.recv_timeout(deadline) {
            Ok(StreamSignal::Opened(remote_id)) => {
                *self.remote_id.lock().unwrap() = remote_id;
                Ok(())
            }
            Ok(StreamSignal::Rejected) => Err(AdbError::ServiceRejected(format!(
                "stream {} rejected by peer",
                self.local_id
            ))),
            Ok(StreamSignal::Failed(reason)) => Err(AdbError::StreamClosed(reason.to_string())),
            Ok(StreamSignal::Closed) => Err(AdbError::ServiceRejected(format!(
                "stream {} closed by peer before open",
                self.local_id
            ))),
            Ok(StreamSignal::WritePermit) => Err(AdbError::InvalidResponse("unexpected WritePermit before open".into())),
            Err(RecvTimeoutError::Timeout) => Err(AdbError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(AdbError::StreamClosed("multiplexer shut down".into())),
        }
    }

    /// Write `data`, splitting it into chunks of at most the session's
    /// negotiated `max_payload` and waiting for the per-chunk `OKAY` before
    /// sending the next one (spec §4.E: "at most one WRTE unacknowledged").
    pub fn write(&self, data: &[u8], deadline: Duration) -> Result<()> {
        if self.local_closed.load(Ordering::SeqCst) {
            return Err(AdbError::StreamClosed("stream is locally closed".into()));
        }
        let _guard = self.write_lock.lock().unwrap();
        let remote_id = self.remote_id();
        let max_payload = self.mux.session.max_payload as usize;
        let start = Instant::now();

        for chunk in data.chunks(max_payload.max(1)) {
            self.mux.send_data(self.local_id, remote_id, chunk)?;
            let remaining = deadline.saturating_sub(start.elapsed());
            let signal = {
                let rx = self.control_rx.lock().unwrap();
                rx.recv_timeout(remaining)
            };
            match signal {
                Ok(StreamSignal::WritePermit) => continue,
                Ok(StreamSignal::Closed) => return Err(AdbError::StreamClosed("peer closed the stream".into())),
                Ok(StreamSignal::Failed(reason)) => return Err(AdbError::StreamClosed(reason.to_string())),
                Ok(StreamSignal::Rejected) | Ok(StreamSignal::Opened(_)) => {
                    return Err(AdbError::InvalidResponse("unexpected signal during write".into()))
                }
                Err(RecvTimeoutError::Timeout) => {
                    let _ = self.close();
                    return Err(AdbError::Timeout);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(AdbError::StreamClosed("multiplexer shut down".into()))
                }
            }
        }
        Ok(())
    }

    /// Read the next chunk of inbound data, or `Ok(None)` at end of stream.
    pub fn read(&self, deadline: Duration) -> Result<Option<Vec<u8>>> {
        let rx = self.data_rx.lock().unwrap();
        match rx.recv_timeout(deadline) {
            Ok(data) => Ok(Some(data)),
            Err(RecvTimeoutError::Disconnected) => Ok(None),
            Err(RecvTimeoutError::Timeout) => Err(AdbError::Timeout),
        }
    }

    /// Read until the peer closes the stream, returning every byte seen.
    pub fn read_to_end(&self, deadline: Duration) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut out = Vec::new();
        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            match self.read(remaining)? {
                Some(mut chunk) => out.append(&mut chunk),
                None => return Ok(out),
            }
        }
    }

    /// Half-/full-close this stream (spec §4.E "Closes"). Idempotent.
    pub fn close(&self) -> Result<()> {
        self.local_closed.store(true, Ordering::SeqCst);
        let remote_id = self.remote_id();
        self.mux.close_stream(self.local_id, remote_id)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl StreamMux {
    /// Mark a stream locally closed and, the first time only, notify the
    /// peer. A table entry is only ever observed in `Open`/`Closing` state
    /// here -- `handle_clse` removes an entry the moment it reaches `Closed`.
    pub(super) fn close_stream(&self, local_id: u32, remote_id: u32) -> Result<()> {
        let already_locally_closed = {
            let mut table = self.table.lock().unwrap();
            match table.streams.get_mut(&local_id) {
                Some(entry) => {
                    let was_closed = entry.locally_closed;
                    entry.locally_closed = true;
                    entry.state = super::StreamState::Closing;
                    was_closed
                }
                None => true,
            }
        };
        if !already_locally_closed {
            self.send_control(Command::CLSE, local_id, remote_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Command as Cmd};
    use crate::connection::Session;
    use crate::transport::test_support::tcp_pair;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

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

    /// S3: open a stream, receive an echoed write, then see the peer close
    /// it -- `read` yields the payload once and then `None` at EOF.
    #[test]
    fn s3_stream_open_echo_and_close() {
        let (host_transport, mut device) = tcp_pair();
        let mux = StreamMux::start(host_transport, test_session());

        let device_thread = thread::spawn(move || {
            let (header, _payload) = codec::read_message(&mut device, false).unwrap();
            assert_eq!(header.command, Cmd::OPEN.as_u32());
            let local_id = header.arg0;
            let remote_id = 17u32;

            codec::encode_and_write(&mut device, Cmd::OKAY, remote_id, local_id, &[], false, 0).unwrap();
            codec::encode_and_write(&mut device, Cmd::WRTE, remote_id, local_id, b"hi\n", false, 0).unwrap();

            // Host acks the WRTE before the next frame can be trusted to land.
            let (ack, _) = codec::read_message(&mut device, false).unwrap();
            assert_eq!(ack.command, Cmd::OKAY.as_u32());

            codec::encode_and_write(&mut device, Cmd::CLSE, remote_id, local_id, &[], false, 0).unwrap();
        });

        let stream = mux.open("echo:", Duration::from_secs(2)).unwrap();
        assert_eq!(stream.remote_id(), 17);

        let chunk = stream.read(Duration::from_secs(2)).unwrap();
        assert_eq!(chunk, Some(b"hi\n".to_vec()));

        let eof = stream.read(Duration::from_secs(2)).unwrap();
        assert_eq!(eof, None);

        device_thread.join().unwrap();
    }
}

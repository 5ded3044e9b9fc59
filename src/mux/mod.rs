//! Stream multiplexer (spec §4.E): owns the single transport, runs the one
//! dedicated reader thread, and routes inbound OKAY/WRTE/CLSE frames to
//! per-stream inboxes by local id.
//!
//! Realized as OS threads plus channels, as spec §9's design notes permit
//! ("Implementations may realize this with OS threads plus channels, or
//! with a single-threaded event loop — the contract is identical"). Cyclic
//! ownership between the multiplexer and its streams is avoided with arena
//! ownership (§9): `StreamMux` owns the routing table; `Stream` handles hold
//! only an id and an `Arc<StreamMux>` back-reference.

mod stream;

pub use stream::Stream;

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::codec::{self, Command};
use crate::connection::Session;
use crate::error::{AdbError, Result};
use crate::transport::{Transport, TransportWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Signals delivered on a stream's control channel — everything except raw
/// inbound payload bytes, which travel on a separate data channel so a
/// blocked `write` never accidentally consumes data meant for `read`.
pub(crate) enum StreamSignal {
    Opened(u32),
    WritePermit,
    Rejected,
    Closed,
    Failed(Arc<str>),
}

struct StreamEntry {
    state: StreamState,
    remote_id: Option<u32>,
    control_tx: mpsc::Sender<StreamSignal>,
    data_tx: Option<mpsc::Sender<Vec<u8>>>,
    locally_closed: bool,
}

struct Table {
    streams: HashMap<u32, StreamEntry>,
    next_id: u32,
}

impl Table {
    fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if id != 0 && !self.streams.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Owns the session's single transport and routing table. Shared behind an
/// `Arc` by every live `Stream`.
pub struct StreamMux {
    writer: Mutex<TransportWriter>,
    table: Mutex<Table>,
    pub session: Session,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamMux {
    /// Take ownership of an already-handshaken transport and spin up the
    /// reader thread. Returns an `Arc` because every `Stream` keeps a
    /// back-reference.
    pub fn start(transport: Transport, session: Session) -> Arc<StreamMux> {
        let (reader, writer) = transport.split();
        let mux = Arc::new(StreamMux {
            writer: Mutex::new(writer),
            table: Mutex::new(Table {
                streams: HashMap::new(),
                next_id: 1,
            }),
            session,
            reader_handle: Mutex::new(None),
        });

        let reader_mux = mux.clone();
        let handle = std::thread::Builder::new()
            .name("adb-core-reader".into())
            .spawn(move || reader_mux.reader_loop(reader))
            .expect("spawn adb reader thread");
        *mux.reader_handle.lock().unwrap() = Some(handle);
        mux
    }

    fn reader_loop(self: Arc<Self>, mut reader: crate::transport::TransportReader) {
        loop {
            match codec::read_message(&mut reader, self.session.checksum_enabled) {
                Ok((header, payload)) => {
                    let command = match header.command() {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("adb reader: {e}");
                            self.fail_session(e);
                            break;
                        }
                    };
                    self.route(command, header.arg0, header.arg1, payload);
                }
                Err(e) => {
                    debug!("adb reader loop ending: {e}");
                    self.fail_session(e);
                    break;
                }
            }
        }
    }

    fn route(&self, command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) {
        match command {
            Command::OKAY => self.handle_okay(arg0, arg1),
            Command::WRTE => self.handle_wrte(arg0, arg1, payload),
            Command::CLSE => self.handle_clse(arg0, arg1),
            _ => debug!("adb reader: ignoring stray {command:?} frame after handshake"),
        }
    }

    fn handle_okay(&self, remote_id: u32, local_id: u32) {
        let mut table = self.table.lock().unwrap();
        let Some(entry) = table.streams.get_mut(&local_id) else {
            return;
        };
        match entry.state {
            StreamState::Opening => {
                entry.remote_id = Some(remote_id);
                entry.state = StreamState::Open;
                let _ = entry.control_tx.send(StreamSignal::Opened(remote_id));
            }
            StreamState::Open => {
                let _ = entry.control_tx.send(StreamSignal::WritePermit);
            }
            StreamState::Closing | StreamState::Closed => {}
        }
    }

    fn handle_wrte(&self, remote_id: u32, local_id: u32, data: Vec<u8>) {
        let deliver = {
            let mut table = self.table.lock().unwrap();
            match table.streams.get_mut(&local_id) {
                Some(entry) if matches!(entry.state, StreamState::Open | StreamState::Closing) => {
                    if let Some(tx) = &entry.data_tx {
                        let _ = tx.send(data);
                    }
                    true
                }
                _ => false,
            }
        };
        if deliver {
            if let Err(e) = self.send_control(Command::OKAY, local_id, remote_id) {
                warn!("adb reader: failed to ack WRTE on stream {local_id}: {e}");
            }
        } else {
            // Unknown stream: reject per spec §4.E ("if unknown, reply CLSE(0, remote)").
            let _ = self.send_control(Command::CLSE, 0, remote_id);
        }
    }

    fn handle_clse(&self, remote_id: u32, local_id: u32) {
        let mut table = self.table.lock().unwrap();
        let Some(entry) = table.streams.get_mut(&local_id) else {
            return;
        };
        if entry.state == StreamState::Opening && remote_id == 0 {
            // Peer rejected our OPEN (spec data model §3, stream lifecycle step 3).
            let entry = table.streams.remove(&local_id).unwrap();
            let _ = entry.control_tx.send(StreamSignal::Rejected);
            return;
        }

        entry.state = StreamState::Closed;
        entry.data_tx = None; // drop sender: pending/future recv() on the data channel sees EOF
        let _ = entry.control_tx.send(StreamSignal::Closed);
        let already_locally_closed = entry.locally_closed;
        entry.locally_closed = true;
        drop(table);

        if !already_locally_closed {
            let _ = self.send_control(Command::CLSE, local_id, remote_id);
        }
        self.table.lock().unwrap().streams.remove(&local_id);
    }

    /// Broadcast a session-ending failure to every live stream (spec §7:
    /// "framing errors and transport errors terminate the session and are
    /// surfaced to every live stream as StreamClosed(cause)").
    fn fail_session(&self, cause: AdbError) {
        let reason: Arc<str> = Arc::from(cause.to_string());
        let mut table = self.table.lock().unwrap();
        for (_, entry) in table.streams.drain() {
            entry.data_tx.map(drop);
            let _ = entry.control_tx.send(StreamSignal::Failed(reason.clone()));
        }
    }

    fn send_control(&self, command: Command, arg0: u32, arg1: u32) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        codec::encode_and_write(&mut *writer, command, arg0, arg1, &[], self.session.checksum_enabled, 0)
    }

    fn send_data(&self, local_id: u32, remote_id: u32, chunk: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        codec::encode_and_write(
            &mut *writer,
            Command::WRTE,
            local_id,
            remote_id,
            chunk,
            self.session.checksum_enabled,
            self.session.max_payload,
        )
    }

    /// Open a logical stream addressing `service` (spec §4.E / §6). Blocks
    /// until the peer replies `OKAY` (stream open) or `CLSE` (rejected), or
    /// until `deadline` elapses.
    pub fn open(self: &Arc<Self>, service: &str, deadline: Duration) -> Result<Stream> {
        let (control_tx, control_rx) = mpsc::channel();
        let (data_tx, data_rx) = mpsc::channel();

        let local_id = {
            let mut table = self.table.lock().unwrap();
            let local_id = table.alloc_id();
            table.streams.insert(
                local_id,
                StreamEntry {
                    state: StreamState::Opening,
                    remote_id: None,
                    control_tx,
                    data_tx: Some(data_tx),
                    locally_closed: false,
                },
            );
            local_id
        };

        let mut payload = service.as_bytes().to_vec();
        if !payload.ends_with(&[0]) {
            payload.push(0);
        }
        if let Err(e) = self.send_control_with_payload(Command::OPEN, local_id, 0, &payload) {
            self.table.lock().unwrap().streams.remove(&local_id);
            return Err(e);
        }

        let stream = Stream::new(self.clone(), local_id, control_rx, data_rx);
        match stream.wait_opened(deadline) {
            Ok(()) => Ok(stream),
            Err(e) => {
                self.table.lock().unwrap().streams.remove(&local_id);
                Err(e)
            }
        }
    }

    fn send_control_with_payload(&self, command: Command, arg0: u32, arg1: u32, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        codec::encode_and_write(&mut *writer, command, arg0, arg1, payload, self.session.checksum_enabled, 0)
    }
}

impl Drop for StreamMux {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            // The reader thread owns the read half and exits on its own once
            // the transport errors or is closed elsewhere; don't block Drop
            // waiting for it.
            drop(handle);
        }
    }
}

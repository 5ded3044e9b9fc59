//! TCP transport (spec §4.B): one duplex byte stream to `host:port`.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::{AdbError, Result};

pub struct TcpTransport {
    stream: TcpStream,
    timeout: Duration,
}

impl TcpTransport {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true).ok();
        let timeout = Duration::from_secs(5);
        stream.set_read_timeout(Some(timeout)).ok();
        stream.set_write_timeout(Some(timeout)).ok();
        Ok(TcpTransport { stream, timeout })
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Self {
        let timeout = Duration::from_secs(5);
        stream.set_read_timeout(Some(timeout)).ok();
        stream.set_write_timeout(Some(timeout)).ok();
        TcpTransport { stream, timeout }
    }

    pub fn set_timeout(&mut self, dur: Duration) {
        self.timeout = dur;
        self.stream.set_read_timeout(Some(dur)).ok();
        self.stream.set_write_timeout(Some(dur)).ok();
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(map_io)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(map_io)
    }

    pub fn close(&mut self) -> Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both).ok();
        Ok(())
    }

    pub fn split(self) -> (TcpReader, TcpWriter) {
        let read_half = self.stream.try_clone().expect("clone tcp stream for read half");
        (
            TcpReader {
                stream: read_half,
                timeout: self.timeout,
            },
            TcpWriter { stream: self.stream },
        )
    }
}

fn map_io(e: std::io::Error) -> AdbError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => AdbError::Timeout,
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
            AdbError::TransportClosed
        }
        _ => AdbError::Io(e),
    }
}

pub struct TcpReader {
    stream: TcpStream,
    #[allow(dead_code)]
    timeout: Duration,
}

impl TcpReader {
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(map_io)
    }

    pub fn set_timeout(&mut self, dur: Duration) {
        self.timeout = dur;
        self.stream.set_read_timeout(Some(dur)).ok();
    }
}

pub struct TcpWriter {
    stream: TcpStream,
}

impl TcpWriter {
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(map_io)
    }
}

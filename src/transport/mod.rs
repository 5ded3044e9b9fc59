//! Transport channel (spec §4.B): duplex byte I/O to a device, framed at the
//! message level. Two concrete variants — TCP and USB bulk — collapse into a
//! sum type so dispatch stays compile-time, per the design notes: the
//! transport is the place where the concrete variant is always known ahead
//! of time, unlike the extension points in §4.C/§4.G which stay dynamic.

pub mod tcp;
pub mod usb;

#[cfg(test)]
pub(crate) mod test_support;

use crate::error::Result;

/// Read half of a channel: the only capability the codec's decode path needs.
pub trait ReadExact {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Write half of a channel: the only capability the codec's encode path needs.
pub trait WriteAll {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
}

/// The four operations the core requires of a channel (spec §6).
pub enum Transport {
    Tcp(tcp::TcpTransport),
    Usb(usb::UsbTransport),
}

pub enum TransportReader {
    Tcp(tcp::TcpReader),
    Usb(usb::UsbReader),
}

pub enum TransportWriter {
    Tcp(tcp::TcpWriter),
    Usb(usb::UsbWriter),
}

impl Transport {
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.read_exact(buf),
            Transport::Usb(t) => t.read_exact(buf),
        }
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.write_all(buf),
            Transport::Usb(t) => t.write_all(buf),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match self {
            Transport::Tcp(t) => t.close(),
            Transport::Usb(t) => t.close(),
        }
    }

    pub fn set_timeout(&mut self, dur: std::time::Duration) {
        match self {
            Transport::Tcp(t) => t.set_timeout(dur),
            Transport::Usb(t) => t.set_timeout(dur),
        }
    }

    /// Split into independently-owned read/write halves so the multiplexer
    /// can run a dedicated reader thread alongside a mutex-guarded writer
    /// (spec §5: "one reader loop", "one writer").
    pub fn split(self) -> (TransportReader, TransportWriter) {
        match self {
            Transport::Tcp(t) => {
                let (r, w) = t.split();
                (TransportReader::Tcp(r), TransportWriter::Tcp(w))
            }
            Transport::Usb(t) => {
                let (r, w) = t.split();
                (TransportReader::Usb(r), TransportWriter::Usb(w))
            }
        }
    }
}

impl TransportReader {
    pub fn set_timeout(&mut self, dur: std::time::Duration) {
        match self {
            TransportReader::Tcp(t) => t.set_timeout(dur),
            TransportReader::Usb(t) => t.set_timeout(dur),
        }
    }
}

impl ReadExact for Transport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        Transport::read_exact(self, buf)
    }
}

impl WriteAll for Transport {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        Transport::write_all(self, buf)
    }
}

impl ReadExact for TransportReader {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self {
            TransportReader::Tcp(t) => t.read_exact(buf),
            TransportReader::Usb(t) => t.read_exact(buf),
        }
    }
}

impl WriteAll for TransportWriter {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            TransportWriter::Tcp(t) => t.write_all(buf),
            TransportWriter::Usb(t) => t.write_all(buf),
        }
    }
}

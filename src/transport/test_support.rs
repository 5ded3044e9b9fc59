//! Test-only transport construction: a real loopback TCP connection pair, so
//! protocol tests exercise the exact same `Transport::Tcp` code path used in
//! production instead of a bespoke in-memory double.

use std::net::{TcpListener, TcpStream};

use super::tcp::TcpTransport;
use super::Transport;

/// Returns two connected ends of a loopback TCP socket, each wrapped as a
/// `Transport`. Writes to one are reads on the other.
pub(crate) fn tcp_pair() -> (Transport, Transport) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let client = TcpStream::connect(addr).expect("connect loopback client");
    let (server, _) = listener.accept().expect("accept loopback connection");
    (
        Transport::Tcp(TcpTransport::from_stream(client)),
        Transport::Tcp(TcpTransport::from_stream(server)),
    )
}

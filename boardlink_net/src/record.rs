// Per-peer connection state.
//
// `LineLink` owns one TCP stream as a line-oriented read/write pair: a
// `BufReader` over a cloned handle for reading and a `BufWriter` for writing.
// The socket carries a short read timeout, so `read_line()` returns
// `Ok(None)` when no complete line is ready instead of blocking. Bytes of an
// incomplete line are kept until the rest arrives.
//
// `ConnectionRecord` is the identity and lifecycle of one peer: the server
// keeps one per client slot in its registry, the client keeps exactly one
// for its server. Records are owned by their role and never shared.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use boardlink_protocol::{ClientId, ConnectionState, Message};
use tracing::debug;

/// Longest accepted line, newline included. A peer that sends more without
/// a newline is dropped.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Line-oriented read/write pair over one TCP stream.
pub struct LineLink {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    partial: Vec<u8>,
}

impl LineLink {
    pub fn new(stream: TcpStream, read_timeout: Duration) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
            partial: Vec::new(),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.writer.get_ref().peer_addr().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.writer.get_ref().local_addr().ok()
    }

    /// Read one complete line if one is available.
    ///
    /// `Ok(None)` means nothing complete arrived within the read timeout.
    /// End of stream (also in the middle of a line) is `UnexpectedEof`, and
    /// a line longer than `MAX_LINE_BYTES` is `InvalidData`.
    ///
    /// A complete line that is not UTF-8 is not a transport error: it is
    /// discarded like any other message nobody matches, and `Ok(None)` is
    /// returned.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        let room = MAX_LINE_BYTES.saturating_sub(self.partial.len()) as u64;
        match (&mut self.reader).take(room).read_until(b'\n', &mut self.partial) {
            Ok(_) if self.partial.len() >= MAX_LINE_BYTES && self.partial.last() != Some(&b'\n') => {
                self.partial.clear();
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line longer than {MAX_LINE_BYTES} bytes"),
                ))
            }
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(_) if self.partial.last() != Some(&b'\n') => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection mid-line",
            )),
            Ok(_) => {
                let mut bytes = std::mem::take(&mut self.partial);
                bytes.pop();
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                match String::from_utf8(bytes) {
                    Ok(line) => Ok(Some(line)),
                    Err(e) => {
                        debug!(len = e.as_bytes().len(), "discarding non-UTF-8 line");
                        Ok(None)
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Write one line and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    pub fn send(&mut self, message: &Message) -> io::Result<()> {
        self.write_line(&message.to_line())
    }

    /// Flush what is buffered and shut the socket down in both directions.
    pub fn shutdown(mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
    }
}

/// Identity and lifecycle of one peer.
pub struct ConnectionRecord {
    pub id: Option<ClientId>,
    pub name: String,
    pub address: Option<SocketAddr>,
    /// Ordinal used by the game engine to map this peer to a player index.
    pub slot: usize,
    pub state: ConnectionState,
    link: Option<LineLink>,
}

impl ConnectionRecord {
    pub fn new(id: Option<ClientId>, slot: usize, state: ConnectionState) -> Self {
        Self {
            id,
            name: String::new(),
            address: None,
            slot,
            state,
            link: None,
        }
    }

    /// Associate a socket with this record. Any previous link is shut down.
    pub fn attach(&mut self, link: LineLink) {
        self.address = link.peer_addr();
        if let Some(old) = self.link.replace(link) {
            old.shutdown();
        }
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.as_ref().and_then(LineLink::local_addr)
    }

    pub fn send(&mut self, message: &Message) -> io::Result<()> {
        match self.link.as_mut() {
            Some(link) => link.send(message),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no socket")),
        }
    }

    /// Read one line if the record has a socket and a line is ready.
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.link.as_mut() {
            Some(link) => link.read_line(),
            None => Ok(None),
        }
    }

    /// Release the socket and mark the peer disconnected. Identity is kept so
    /// the slot can be re-armed.
    pub fn disconnect(&mut self) {
        self.state = ConnectionState::Disconnected;
        if let Some(link) = self.link.take() {
            link.shutdown();
        }
    }

    /// Back to the initial empty values.
    pub fn reset(&mut self) {
        self.disconnect();
        self.id = None;
        self.name.clear();
        self.address = None;
    }
}

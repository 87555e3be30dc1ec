//! Client connections and the registry of watched sockets.
//!
//! The registry owns the mio `Poll`, the listening socket and every live
//! client stream. Client tokens are slab keys; the listener always uses
//! [`LISTENER`].

use crate::protocol::ProtocolError;
use crate::storage::IndexError;
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Token reserved for the listening socket.
pub const LISTENER: Token = Token(usize::MAX);

/// Chunk size for a single `read` call.
const READ_CHUNK: usize = 4 * 1024;

/// Bytes read from one connection per pass before other sockets get a turn.
pub const READ_BUDGET: usize = 64 * 1024;

/// Why a connection is being torn down.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Peer closed its end. Normal termination.
    #[error("peer closed the connection")]
    Disconnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of one read pass over a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Socket drained until it would block.
    Drained,
    /// Read budget spent; the socket may hold more data.
    Budget,
    /// Read returned zero bytes.
    PeerClosed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    pub peer: SocketAddr,
    /// Bytes received but not yet decoded (at most one partial frame
    /// between event-loop passes).
    pub read_buf: BytesMut,
    /// Encoded responses not yet accepted by the socket.
    pub write_buf: BytesMut,
    /// Whether the socket is registered for writability.
    write_interest: bool,
    /// The socket may hold bytes not yet read. Reading is suspended while
    /// replies are pending, so this survives across events.
    pub read_ready: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            write_interest: false,
            read_ready: false,
        }
    }

    /// Read until the socket would block, the peer closes, or `budget`
    /// bytes have been read.
    ///
    /// mio is edge-triggered: after [`ReadOutcome::Budget`] no new event
    /// arrives for data already queued, so the caller must come back.
    pub fn fill(&mut self, budget: usize) -> io::Result<ReadOutcome> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;
        while total < budget {
            let want = READ_CHUNK.min(budget - total);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => return Ok(ReadOutcome::PeerClosed),
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Drained)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Budget)
    }

    /// Write buffered responses until done or the socket would block.
    pub fn flush(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.stream.write(&self.write_buf) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.write_buf.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_buf.is_empty()
    }
}

/// The live set of watched sockets.
///
/// Always contains the listener until [`close_all`](Self::close_all) runs.
pub struct ConnectionRegistry {
    poll: Poll,
    listener: Option<TcpListener>,
    connections: Slab<Connection>,
    /// `None` accepts without limit.
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    /// Create a registry watching `listener`.
    pub fn new(mut listener: TcpListener, max_connections: Option<usize>) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener: Some(listener),
            connections: Slab::with_capacity(max_connections.unwrap_or(64).min(1024)),
            max_connections,
        })
    }

    /// Wait for readiness on any watched socket.
    ///
    /// A signal interrupting the wait is reported as an empty poll.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            other => other,
        }
    }

    pub fn listener(&self) -> Option<&TcpListener> {
        self.listener.as_ref()
    }

    /// Start watching a newly accepted stream.
    ///
    /// Returns `None` if a connection limit is set and reached; the stream
    /// is dropped.
    pub fn add(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<Option<usize>> {
        if let Some(max) = self.max_connections {
            if self.connections.len() >= max {
                return Ok(None);
            }
        }

        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let conn = entry.insert(Connection::new(stream, peer));
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut conn.stream, Token(id), Interest::READABLE)
        {
            self.connections.remove(id);
            return Err(e);
        }
        Ok(Some(id))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Toggle write interest for a connection with buffered output.
    pub fn set_write_interest(&mut self, id: usize, enabled: bool) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(id) else {
            return Ok(());
        };
        if conn.write_interest == enabled {
            return Ok(());
        }

        let interest = if enabled {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.poll
            .registry()
            .reregister(&mut conn.stream, Token(id), interest)?;
        conn.write_interest = enabled;
        Ok(())
    }

    /// Stop watching a connection and release its socket.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        let mut conn = self.connections.try_remove(id)?;
        let _ = self.poll.registry().deregister(&mut conn.stream);
        Some(conn)
    }

    /// Close every client and the listener. Returns the number of clients closed.
    pub fn close_all(&mut self) -> usize {
        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for &id in &ids {
            if let Some(conn) = self.remove(id) {
                debug!(conn_id = id, peer = %conn.peer, "Connection closed on shutdown");
            }
        }

        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        ids.len()
    }

    /// Number of watched sockets, listener included.
    pub fn len(&self) -> usize {
        self.connections.len() + usize::from(self.listener.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.connections.len()
    }
}

//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform non-blocking read/write syscalls. Uses epoll on Linux, kqueue on
//! macOS. Everything runs on one thread, which is also the only thread that
//! touches the matrix.

use crate::config::Config;
use crate::runtime::connection::{
    ConnectionError, ConnectionRegistry, ReadOutcome, LISTENER, READ_BUDGET,
};
use crate::runtime::request::process_buffered;
use crate::storage::Matrix;
use mio::net::TcpListener;
use mio::{Events, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Single-threaded server loop.
pub struct EventLoop {
    registry: ConnectionRegistry,
    matrix: Matrix,
    events_capacity: usize,
    poll_timeout: Duration,
    shutdown: Arc<AtomicBool>,
    /// Connections that spent their read budget with data still queued.
    deferred: Vec<usize>,
}

impl EventLoop {
    pub fn new(
        listener: TcpListener,
        config: &Config,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        Ok(Self {
            registry: ConnectionRegistry::new(listener, config.max_connections)?,
            matrix: Matrix::new(),
            events_capacity: config.events_capacity,
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            shutdown,
            deferred: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.registry
            .listener()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "listener closed"))?
            .local_addr()
    }

    /// Serve until the shutdown flag is raised and every socket is closed.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.events_capacity);

        while !self.registry.is_empty() {
            if self.shutdown.load(Ordering::Relaxed) {
                let closed = self.registry.close_all();
                info!(closed, "Shutdown requested, closed all connections");
                break;
            }

            // Queued input gets its turn without waiting out the timeout
            let deferred = std::mem::take(&mut self.deferred);
            let timeout = if deferred.is_empty() {
                self.poll_timeout
            } else {
                Duration::ZERO
            };
            self.registry.poll(&mut events, Some(timeout))?;

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_connections(),
                    Token(conn_id) => {
                        let result = self.handle_connection_event(
                            conn_id,
                            event.is_readable(),
                            event.is_writable(),
                        );
                        if let Err(e) = result {
                            self.close_connection(conn_id, e);
                        }
                    }
                }
            }

            for conn_id in deferred {
                if let Err(e) = self.handle_connection_event(conn_id, false, false) {
                    self.close_connection(conn_id, e);
                }
            }
        }

        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            let accepted = match self.registry.listener() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, peer)) => match self.registry.add(stream, peer) {
                    Ok(Some(conn_id)) => {
                        debug!(conn_id, peer = %peer, "Accepted connection");
                    }
                    Ok(None) => {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                    }
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Flush pending replies, then read and answer at most one budget of
    /// input. Reading waits until earlier replies have left the buffer, so a
    /// client that never reads stops being read from.
    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        readable: bool,
        writable: bool,
    ) -> Result<(), ConnectionError> {
        let Some(conn) = self.registry.get_mut(conn_id) else {
            return Ok(());
        };

        if readable {
            conn.read_ready = true;
        }
        if writable || conn.has_pending_writes() {
            conn.flush()?;
        }

        let mut outcome = ReadOutcome::Drained;
        if conn.read_ready && !conn.has_pending_writes() {
            outcome = conn.fill(READ_BUDGET)?;
            conn.read_ready = outcome == ReadOutcome::Budget;

            match process_buffered(&mut conn.read_buf, &mut conn.write_buf, &mut self.matrix) {
                Ok(answered) => {
                    trace!(conn_id, answered, "Processed frames");
                }
                Err(e) => {
                    // Deliver whatever was answered before the bad frame
                    if let Err(flush_err) = conn.flush() {
                        debug!(conn_id, error = %flush_err, "Failed to flush before close");
                    }
                    return Err(e);
                }
            }
            conn.flush()?;
        }

        if outcome == ReadOutcome::PeerClosed {
            if !conn.read_buf.is_empty() {
                debug!(
                    conn_id,
                    leftover = conn.read_buf.len(),
                    "Peer closed with a partial frame buffered"
                );
            }
            return Err(ConnectionError::Disconnected);
        }

        let pending = conn.has_pending_writes();
        if conn.read_ready && !pending && !self.deferred.contains(&conn_id) {
            self.deferred.push(conn_id);
        }
        self.registry.set_write_interest(conn_id, pending)?;
        Ok(())
    }

    fn close_connection(&mut self, conn_id: usize, reason: ConnectionError) {
        let Some(conn) = self.registry.remove(conn_id) else {
            return;
        };
        let remaining = self.registry.client_count();
        self.deferred.retain(|&id| id != conn_id);

        match reason {
            ConnectionError::Disconnected => {
                debug!(conn_id, peer = %conn.peer, remaining, "Connection closed by peer");
            }
            ConnectionError::Protocol(_) | ConnectionError::Index(_) => {
                warn!(
                    conn_id,
                    peer = %conn.peer,
                    remaining,
                    error = %reason,
                    "Terminating connection"
                );
            }
            ConnectionError::Io(ref e) => {
                debug!(conn_id, peer = %conn.peer, remaining, error = %e, "Connection error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{self, Command, FRAME_SIZE, RESPONSE_SIZE};
    use crate::runtime::bind_listener;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::thread::{self, JoinHandle};
    use std::time::Instant;

    struct TestServer {
        addr: SocketAddr,
        shutdown: Arc<AtomicBool>,
        handle: Option<JoinHandle<io::Result<()>>>,
    }

    impl TestServer {
        fn start() -> Self {
            Self::with_config(Config {
                listen: "127.0.0.1:0".parse().unwrap(),
                backlog: 128,
                poll_timeout_ms: 20,
                ..Config::default()
            })
        }

        fn with_config(config: Config) -> Self {
            let shutdown = Arc::new(AtomicBool::new(false));
            let listener = bind_listener(config.listen, config.backlog).unwrap();
            let mut event_loop =
                EventLoop::new(listener, &config, Arc::clone(&shutdown)).unwrap();
            let addr = event_loop.local_addr().unwrap();
            let handle = thread::spawn(move || event_loop.run());

            Self {
                addr,
                shutdown,
                handle: Some(handle),
            }
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(&mut self) -> io::Result<()> {
            self.shutdown.store(true, Ordering::Relaxed);
            match self.handle.take() {
                Some(handle) => handle.join().unwrap(),
                None => Ok(()),
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            let _ = self.stop();
        }
    }

    fn request(stream: &mut TcpStream, command: Command) -> i32 {
        stream.write_all(&command.encode()).unwrap();
        read_response(stream)
    }

    fn read_response(stream: &mut TcpStream) -> i32 {
        let mut reply = [0u8; RESPONSE_SIZE];
        stream.read_exact(&mut reply).unwrap();
        protocol::decode_response(&reply)
    }

    /// The server closed its end: EOF or reset, never a reply.
    fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; RESPONSE_SIZE];
        match stream.read(&mut buf) {
            Ok(0) => {}
            Err(e)
                if e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::TimedOut => {}
            other => panic!("expected closed connection, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_matrix_sum() {
        let server = TestServer::start();
        let mut client = server.connect();
        assert_eq!(request(&mut client, Command::sum()), 0);
    }

    #[test]
    fn test_set_get_sum_session() {
        let server = TestServer::start();
        let mut client = server.connect();

        assert_eq!(request(&mut client, Command::set(1, 1, 5)), 5);
        assert_eq!(request(&mut client, Command::set(1, 2, 10)), 10);
        assert_eq!(request(&mut client, Command::set(2, 1, 5)), 5);
        assert_eq!(request(&mut client, Command::sum()), 20);
        assert_eq!(request(&mut client, Command::get(1, 1)), 5);
        assert_eq!(request(&mut client, Command::get(1, 1)), 5);
    }

    #[test]
    fn test_unknown_operation_closes_only_that_connection() {
        let server = TestServer::start();
        let mut good = server.connect();
        let mut bad = server.connect();

        assert_eq!(request(&mut good, Command::set(0, 0, 3)), 3);

        let mut frame = Command::sum().encode();
        frame[..3].copy_from_slice(b"FOO");
        bad.write_all(&frame).unwrap();
        assert_closed(&mut bad);

        assert_eq!(request(&mut good, Command::sum()), 3);
    }

    #[test]
    fn test_out_of_bounds_closes_connection() {
        let server = TestServer::start();
        let mut bad = server.connect();
        bad.write_all(&Command::set(3, 0, 99).encode()).unwrap();
        assert_closed(&mut bad);

        let mut other = server.connect();
        assert_eq!(request(&mut other, Command::sum()), 0);
    }

    #[test]
    fn test_disconnect_leaves_state_and_peers_intact() {
        let server = TestServer::start();
        let mut staying = server.connect();

        {
            let mut leaving = server.connect();
            assert_eq!(request(&mut leaving, Command::set(2, 2, 7)), 7);
        }

        assert_eq!(request(&mut staying, Command::get(2, 2)), 7);
        assert_eq!(request(&mut staying, Command::sum()), 7);

        // New clients still get in after the disconnect
        let mut late = server.connect();
        assert_eq!(request(&mut late, Command::get(2, 2)), 7);
    }

    #[test]
    fn test_partial_frame_is_buffered() {
        let server = TestServer::start();
        let mut client = server.connect();

        let frame = Command::set(0, 1, 42).encode();
        client.write_all(&frame[..6]).unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        client.write_all(&frame[6..]).unwrap();

        assert_eq!(read_response(&mut client), 42);
        assert_eq!(request(&mut client, Command::get(0, 1)), 42);
    }

    #[test]
    fn test_pipelined_frames_answered_in_order() {
        let server = TestServer::start();
        let mut client = server.connect();

        let mut batch = Vec::new();
        batch.extend_from_slice(&Command::set(0, 0, 1).encode());
        batch.extend_from_slice(&Command::set(0, 1, 2).encode());
        batch.extend_from_slice(&Command::sum().encode());
        client.write_all(&batch).unwrap();

        assert_eq!(read_response(&mut client), 1);
        assert_eq!(read_response(&mut client), 2);
        assert_eq!(read_response(&mut client), 3);
    }

    #[test]
    fn test_interleaved_clients_on_different_cells() {
        let server = TestServer::start();
        let mut a = server.connect();
        let mut b = server.connect();

        for i in 0..20 {
            assert_eq!(request(&mut a, Command::set(0, 0, i)), i);
            assert_eq!(request(&mut b, Command::set(2, 2, -i)), -i);
        }
        assert_eq!(request(&mut a, Command::get(0, 0)), 19);
        assert_eq!(request(&mut b, Command::get(2, 2)), -19);
        assert_eq!(request(&mut a, Command::sum()), 0);

        // Cells nobody wrote stay zero
        assert_eq!(request(&mut b, Command::get(1, 1)), 0);
    }

    #[test]
    fn test_concurrent_clients_each_write_once() {
        let server = TestServer::start();
        let addr = server.addr;

        let handles: Vec<_> = (0..9)
            .map(|cell| {
                thread::spawn(move || {
                    let mut client = TcpStream::connect(addr).unwrap();
                    client
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    let (row, col) = (cell / 3, cell % 3);
                    request(&mut client, Command::set(row, col, cell + 1))
                })
            })
            .collect();

        for (cell, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), cell as i32 + 1);
        }

        let mut client = server.connect();
        assert_eq!(request(&mut client, Command::sum()), (1..=9).sum::<i32>());
    }

    #[test]
    fn test_connection_limit_rejects_extra_clients() {
        let server = TestServer::with_config(Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            max_connections: Some(1),
            poll_timeout_ms: 20,
            ..Config::default()
        });

        let mut first = server.connect();
        assert_eq!(request(&mut first, Command::sum()), 0);

        let mut second = server.connect();
        let _ = second.write_all(&Command::sum().encode());
        assert_closed(&mut second);

        // The admitted client is unaffected
        assert_eq!(request(&mut first, Command::set(0, 0, 1)), 1);
    }

    #[test]
    fn test_frames_before_half_close_are_answered() {
        let server = TestServer::start();
        let mut client = server.connect();

        let mut batch = Vec::new();
        batch.extend_from_slice(&Command::set(1, 2, 11).encode());
        batch.extend_from_slice(&Command::sum().encode());
        client.write_all(&batch).unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        assert_eq!(read_response(&mut client), 11);
        assert_eq!(read_response(&mut client), 11);
        assert_closed(&mut client);

        let mut other = server.connect();
        assert_eq!(request(&mut other, Command::get(1, 2)), 11);
    }

    /// Writes SUM frames until the server stops accepting them.
    fn flood(mut stream: TcpStream) -> JoinHandle<()> {
        let mut batch = Vec::with_capacity(4096 * FRAME_SIZE);
        for _ in 0..4096 {
            batch.extend_from_slice(&Command::sum().encode());
        }
        thread::spawn(move || {
            for _ in 0..1000 {
                if stream.write_all(&batch).is_err() {
                    break;
                }
            }
        })
    }

    #[test]
    fn test_unread_replies_stop_reading() {
        let config = Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        };
        let listener = bind_listener(config.listen, config.backlog).unwrap();
        let mut event_loop =
            EventLoop::new(listener, &config, Arc::new(AtomicBool::new(false))).unwrap();
        // A tiny receive window makes unread replies back up quickly
        let socket =
            socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        socket
            .connect(&event_loop.local_addr().unwrap().into())
            .unwrap();
        let client: TcpStream = socket.into();

        let deadline = Instant::now() + Duration::from_secs(5);
        while event_loop.registry.client_count() == 0 {
            assert!(Instant::now() < deadline, "connection never accepted");
            event_loop.accept_connections();
            thread::sleep(Duration::from_millis(1));
        }
        // First slab key
        let conn_id = 0;

        let writer = client.try_clone().unwrap();
        writer
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let flooder = flood(writer);

        let max_pending = (READ_BUDGET / FRAME_SIZE + 1) * RESPONSE_SIZE;
        let mut max_seen = 0;
        let mut paused_passes = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while paused_passes < 50 {
            assert!(Instant::now() < deadline, "server never stopped reading");
            event_loop
                .handle_connection_event(conn_id, true, true)
                .unwrap();

            let conn = event_loop.registry.get_mut(conn_id).unwrap();
            assert!(conn.read_buf.len() < READ_BUDGET + FRAME_SIZE);
            max_seen = max_seen.max(conn.write_buf.len());
            if conn.has_pending_writes() {
                paused_passes += 1;
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert!(
            max_seen <= max_pending,
            "write_buf reached {} bytes, bound is {}",
            max_seen,
            max_pending
        );

        drop(event_loop);
        drop(client);
        flooder.join().unwrap();
    }

    #[test]
    fn test_flooding_client_does_not_stall_others() {
        let server = TestServer::start();
        let flooder = flood(server.connect());

        let mut client = server.connect();
        for i in 0..20 {
            assert_eq!(request(&mut client, Command::set(0, 0, i)), i);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(request(&mut client, Command::get(0, 0)), 19);

        drop(server);
        flooder.join().unwrap();
    }

    #[test]
    fn test_shutdown_closes_everything() {
        let mut server = TestServer::start();
        let mut client = server.connect();
        assert_eq!(request(&mut client, Command::set(1, 0, 1)), 1);

        let started = Instant::now();
        server.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));

        assert_closed(&mut client);
        assert!(TcpStream::connect(server.addr).is_err());
    }
}

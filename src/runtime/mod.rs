//! Readiness-based server runtime.
//!
//! One mio event loop (epoll on Linux, kqueue on macOS) owns the listener,
//! every client connection and the matrix:
//! - `connection`: per-client buffers and the registry of watched sockets
//! - `request`: frame decoding and dispatch to the matrix
//! - `event_loop`: the poll/accept/read/write cycle

mod connection;
mod event_loop;
mod request;

pub use event_loop::EventLoop;

use crate::config::Config;
use mio::net::TcpListener;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

/// Run the server until `shutdown` is raised.
pub fn run(config: Config, shutdown: Arc<AtomicBool>) -> io::Result<()> {
    let listener = bind_listener(config.listen, config.backlog)?;
    let mut event_loop = EventLoop::new(listener, &config, shutdown)?;

    info!(
        addr = %event_loop.local_addr()?,
        max_connections = ?config.max_connections,
        poll_timeout_ms = config.poll_timeout_ms,
        "Listening"
    );

    event_loop.run()
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}

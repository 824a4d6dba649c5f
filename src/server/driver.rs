//! Runs one [`Connection`] over real sockets.
//!
//! The connection decides what to wait for; the driver waits for readiness
//! and moves bytes with non-blocking `try_read_buf`/`try_write`.

use std::io;
use std::time::{Duration, Instant};

use bytes::Buf;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::session::{BackendTarget, Connection, Interest, Side, Step};
use crate::socket::Socket;

const READ_CHUNK: usize = 16 * 1024;

pub async fn drive(mut conn: Connection, connect_timeout: Duration) {
    loop {
        match conn.step() {
            Step::Advanced => {}
            Step::Done => break,
            Step::Connect(target) => connect(&mut conn, target, connect_timeout).await,
            Step::WouldBlock(Interest::Read(side)) => match fill(socket_of(&mut conn, side)).await {
                Ok(0) => conn.peer_closed(side),
                Ok(n) => debug!(conn_id = conn.id(), side = side.name(), bytes = n, "Read"),
                Err(e) => conn.io_failed(side, &e),
            },
            Step::WouldBlock(Interest::Write(side)) => {
                if let Err(e) = flush(socket_of(&mut conn, side)).await {
                    conn.io_failed(side, &e);
                }
            }
        }
    }
    debug!(conn_id = conn.id(), "Connection finished");
}

async fn connect(conn: &mut Connection, target: BackendTarget, timeout: Duration) {
    match tokio::time::timeout(timeout, TcpStream::connect(target.addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(conn_id = conn.id(), error = %e, "Failed to set TCP_NODELAY on backend socket");
            }
            conn.server_connected(Socket::new(stream));
        }
        Ok(Err(e)) => conn.server_connect_failed(Instant::now(), &e),
        Err(_) => {
            let e = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
            conn.server_connect_failed(Instant::now(), &e);
        }
    }
}

fn socket_of(conn: &mut Connection, side: Side) -> Option<&mut Socket> {
    match side {
        Side::Client => Some(conn.client_mut()),
        Side::Server => conn.server_mut(),
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket has no stream")
}

/// Read whatever is available; `Ok(0)` means the peer closed
async fn fill(socket: Option<&mut Socket>) -> io::Result<usize> {
    let socket = socket.ok_or_else(not_connected)?;
    let stream = socket.stream().cloned().ok_or_else(not_connected)?;

    loop {
        stream.readable().await?;
        let buf = socket.recv_buf_mut();
        buf.reserve(READ_CHUNK);
        match stream.try_read_buf(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Write out the whole send queue
async fn flush(socket: Option<&mut Socket>) -> io::Result<()> {
    let socket = socket.ok_or_else(not_connected)?;
    let stream = socket.stream().cloned().ok_or_else(not_connected)?;

    while socket.has_pending_send() {
        stream.writable().await?;
        let queue = socket.send_queue_mut();
        match stream.try_write(queue.chunk()) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => queue.advance(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

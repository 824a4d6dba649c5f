//! End-to-end tests: a real proxy between a test client and a scripted
//! in-process MySQL backend.
//!
//! Run with: cargo test --test integration

mod hooks;
mod passthrough;
mod pooling;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use mysql_proxy::config::Config;
use mysql_proxy::hooks::HookFactory;
use mysql_proxy::protocol::capabilities::*;
use mysql_proxy::protocol::{
    is_eof, is_err, is_ok, status, AuthChallenge, AuthResponse, Column, Command, OkPacket,
    Packet, PacketCodec, ResultSet,
};
use mysql_proxy::server::Server;

pub const DB: &str = "shop";
const TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted backend: handshake, accept any login, answer `SELECT` with the
/// serving connection's thread id and everything else with OK
pub struct FakeBackend {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    /// Command bytes received after login, across all connections
    pub commands: Arc<Mutex<Vec<u8>>>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&accepted);
        let seen = Arc::clone(&commands);
        tokio::spawn(async move {
            let next_thread_id = AtomicU32::new(100);
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let thread_id = next_thread_id.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_backend(stream, thread_id, Arc::clone(&seen)));
            }
        });

        Self {
            addr,
            accepted,
            commands,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

pub fn challenge(thread_id: u32) -> AuthChallenge {
    AuthChallenge {
        protocol_version: 10,
        server_version_str: "5.0.45-log".to_string(),
        server_version: 50045,
        thread_id,
        scramble_head: *b"abcdefgh",
        scramble_tail: Bytes::from_static(b"ijklmnopqrst"),
        capabilities: CLIENT_PROTOCOL_41
            | CLIENT_SECURE_CONNECTION
            | CLIENT_CONNECT_WITH_DB
            | CLIENT_SSL
            | CLIENT_COMPRESS,
        charset: 0x08,
        server_status: status::SERVER_STATUS_AUTOCOMMIT,
        auth_plugin_data_len: 0,
        auth_plugin_name: None,
    }
}

async fn serve_backend(stream: TcpStream, thread_id: u32, commands: Arc<Mutex<Vec<u8>>>) {
    let mut framed = Framed::new(stream, PacketCodec::new());
    if framed
        .send(Packet::new(0, challenge(thread_id).encode()))
        .await
        .is_err()
    {
        return;
    }
    let Some(Ok(auth)) = framed.next().await else {
        return;
    };
    let ok = OkPacket::default().encode();
    if framed
        .send(Packet::new(auth.sequence_id.wrapping_add(1), ok.clone()))
        .await
        .is_err()
    {
        return;
    }

    while let Some(Ok(packet)) = framed.next().await {
        let Some(command) = packet.first_byte() else {
            return;
        };
        commands.lock().push(command);
        let mut seq = packet.sequence_id.wrapping_add(1);

        let replies = match Command::from(command) {
            Command::Quit => return,
            Command::Query if packet.payload[1..].starts_with(b"SELECT") => {
                let mut result = ResultSet::new(vec![Column::new("thread_id")]);
                result.push_row(vec![Some(thread_id.to_string())]);
                result.encode()
            }
            _ => vec![ok.clone()],
        };
        for payload in replies {
            if framed.feed(Packet::new(seq, payload)).await.is_err() {
                return;
            }
            seq = seq.wrapping_add(1);
        }
        if framed.flush().await.is_err() {
            return;
        }
    }
}

/// Config pointing the proxy at the given read-write backends
pub fn config_for(backends: &[SocketAddr]) -> Config {
    let mut config = Config::default();
    config.backends.rw = backends.iter().map(ToString::to_string).collect();
    config.server.connect_timeout_ms = 1000;
    config
}

/// Serve a proxy on an ephemeral port until the token is cancelled
pub async fn start_proxy(
    config: Config,
    hooks: Arc<dyn HookFactory>,
) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(Server::new(config, hooks).serve(listener, shutdown.clone()));
    (addr, shutdown)
}

pub struct Client {
    framed: Framed<TcpStream, PacketCodec>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, PacketCodec::new()),
        }
    }

    pub async fn recv(&mut self) -> Packet {
        tokio::time::timeout(TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a packet")
            .expect("connection closed")
            .unwrap()
    }

    pub async fn send(&mut self, sequence_id: u8, payload: impl Into<Bytes>) {
        self.framed
            .send(Packet::new(sequence_id, payload))
            .await
            .unwrap();
    }

    /// Read the proxy's handshake and answer it as `username`
    pub async fn login(&mut self, username: &str) -> (AuthChallenge, Packet) {
        let handshake = self.recv().await;
        let challenge = AuthChallenge::decode(&handshake.payload).unwrap();

        let auth = AuthResponse {
            capabilities: CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION | CLIENT_CONNECT_WITH_DB,
            max_packet_size: 1 << 24,
            charset: 0x08,
            username: username.to_string(),
            auth_data: Bytes::from_static(b"01234567890123456789"),
            database: Some(DB.to_string()),
            auth_plugin_name: None,
            trailing: Bytes::new(),
        };
        self.send(handshake.sequence_id.wrapping_add(1), auth.encode())
            .await;
        let result = self.recv().await;
        (challenge, result)
    }

    /// Send a COM_QUERY and collect the full response
    pub async fn query(&mut self, sql: &str) -> Vec<Packet> {
        let mut payload = vec![Command::Query as u8];
        payload.extend_from_slice(sql.as_bytes());
        self.send(0, payload).await;

        let first = self.recv().await;
        if is_ok(&first.payload) || is_err(&first.payload) {
            return vec![first];
        }
        let mut packets = vec![first];
        let mut eofs = 0;
        while eofs < 2 {
            let packet = self.recv().await;
            if is_eof(&packet.payload) {
                eofs += 1;
            }
            packets.push(packet);
        }
        packets
    }

    /// Send COM_QUIT and wait for the proxy to hang up
    pub async fn quit(mut self) {
        self.send(0, vec![Command::Quit as u8]).await;
        let next = tokio::time::timeout(TIMEOUT, self.framed.next())
            .await
            .expect("proxy did not close the connection");
        assert!(next.is_none() || next.is_some_and(|r| r.is_err()));
    }
}

/// Text value of the single cell in a one-row result set
pub fn single_value(packets: &[Packet]) -> String {
    assert_eq!(packets.len(), 5, "expected a one-column one-row result set");
    let row = &packets[3].payload;
    let len = row[0] as usize;
    String::from_utf8(row[1..1 + len].to_vec()).unwrap()
}

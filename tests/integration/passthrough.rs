use mysql_proxy::hooks::pass_through;
use mysql_proxy::protocol::capabilities::{CLIENT_COMPRESS, CLIENT_SSL};
use mysql_proxy::protocol::{is_err, is_ok, ErrPacket};
use tokio::net::TcpListener;

use crate::{config_for, single_value, start_proxy, Client, FakeBackend};

#[tokio::test]
async fn test_login_and_query_pass_through() {
    let backend = FakeBackend::start().await;
    let (proxy, shutdown) = start_proxy(config_for(&[backend.addr]), pass_through()).await;

    let mut client = Client::connect(proxy).await;
    let (challenge, result) = client.login("alice").await;
    assert_eq!(challenge.server_version, 50045);
    assert_eq!(challenge.thread_id, 100);
    assert_eq!(challenge.capabilities & (CLIENT_SSL | CLIENT_COMPRESS), 0);
    assert!(is_ok(&result.payload));
    assert_eq!(result.sequence_id, 2);

    let rows = client.query("SELECT CONNECTION_ID()").await;
    assert_eq!(single_value(&rows), "100");
    let ids: Vec<u8> = rows.iter().map(|p| p.sequence_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let ok = client.query("SET autocommit = 1").await;
    assert!(is_ok(&ok[0].payload));

    client.quit().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_all_backends_down() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let (proxy, shutdown) = start_proxy(config_for(&[closed]), pass_through()).await;

    let mut client = Client::connect(proxy).await;
    let reply = client.recv().await;
    assert!(is_err(&reply.payload));
    let err = ErrPacket::decode(&reply.payload).unwrap();
    assert!(err.message.contains("all backends are down"), "{}", err.message);

    shutdown.cancel();
}

#[tokio::test]
async fn test_second_backend_used_when_first_is_down() {
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let backend = FakeBackend::start().await;
    let (proxy, shutdown) = start_proxy(config_for(&[closed, backend.addr]), pass_through()).await;

    let mut client = Client::connect(proxy).await;
    let (_, result) = client.login("alice").await;
    assert!(is_ok(&result.payload));
    assert_eq!(backend.accepted(), 1);

    client.quit().await;
    shutdown.cancel();
}

use mysql_proxy::hooks::pass_through;
use mysql_proxy::protocol::{is_err, is_ok, Command};

use crate::{config_for, single_value, start_proxy, Client, FakeBackend};

#[tokio::test]
async fn test_backend_reused_with_change_user() {
    let backend = FakeBackend::start().await;
    let (proxy, shutdown) = start_proxy(config_for(&[backend.addr]), pass_through()).await;

    let mut first = Client::connect(proxy).await;
    first.login("alice").await;
    let first_thread = single_value(&first.query("SELECT CONNECTION_ID()").await);
    first.quit().await;

    let mut second = Client::connect(proxy).await;
    let (challenge, result) = second.login("bob").await;
    assert_eq!(challenge.thread_id.to_string(), first_thread);
    assert!(is_ok(&result.payload));

    let second_thread = single_value(&second.query("SELECT CONNECTION_ID()").await);
    assert_eq!(second_thread, first_thread);
    assert_eq!(backend.accepted(), 1);
    assert!(backend.commands.lock().contains(&(Command::ChangeUser as u8)));

    second.quit().await;
    shutdown.cancel();
}

#[tokio::test]
async fn test_backend_reused_with_fast_auth() {
    let backend = FakeBackend::start().await;
    let mut config = config_for(&[backend.addr]);
    config.proxy.pool_change_user = false;
    let (proxy, shutdown) = start_proxy(config, pass_through()).await;

    let mut first = Client::connect(proxy).await;
    first.login("alice").await;
    first.quit().await;

    let mut second = Client::connect(proxy).await;
    let (_, result) = second.login("alice").await;
    assert!(is_ok(&result.payload));
    assert_eq!(backend.accepted(), 1);
    assert!(!backend.commands.lock().contains(&(Command::ChangeUser as u8)));
    second.quit().await;

    let mut stranger = Client::connect(proxy).await;
    let (_, result) = stranger.login("mallory").await;
    assert!(is_err(&result.payload));

    shutdown.cancel();
}

use std::sync::Arc;

use mysql_proxy::hooks::{HookDecision, HookFactory, HookResult, ProxyHooks};
use mysql_proxy::protocol::{Column, Packet, ResultSet};
use mysql_proxy::session::Connection;

use crate::{config_for, single_value, start_proxy, Client, FakeBackend};

/// Answers `SELECT @@proxy` locally
struct LocalAnswer;

impl ProxyHooks for LocalAnswer {
    fn read_query(&mut self, conn: &mut Connection, packet: &Packet) -> HookResult {
        if &packet.payload[1..] != b"SELECT @@proxy" {
            return Ok(HookDecision::NoDecision);
        }
        let mut result = ResultSet::new(vec![Column::new("@@proxy")]);
        result.push_row(vec![Some("mysql-proxy".to_string())]);
        conn.send_result_set(&result);
        Ok(HookDecision::SendResult)
    }
}

#[tokio::test]
async fn test_hook_answers_without_backend() {
    let backend = FakeBackend::start().await;
    let factory: Arc<dyn HookFactory> =
        Arc::new(|| Box::new(LocalAnswer) as Box<dyn ProxyHooks>);
    let (proxy, shutdown) = start_proxy(config_for(&[backend.addr]), factory).await;

    let mut client = Client::connect(proxy).await;
    client.login("alice").await;

    let local = client.query("SELECT @@proxy").await;
    assert_eq!(single_value(&local), "mysql-proxy");
    assert!(backend.commands.lock().is_empty());

    let remote = client.query("SELECT CONNECTION_ID()").await;
    assert_eq!(single_value(&remote), "100");
    assert_eq!(backend.commands.lock().len(), 1);

    client.quit().await;
    shutdown.cancel();
}

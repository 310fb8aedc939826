//! End-to-end tests over real sockets
//!
//! A controller node connects through the TCP connector, completes the cookie
//! handshake and talks to the bridge like a remote Erlang node would.

mod common;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use common::*;
use rvoip_erlang_bridge::logging::setup_logging;
use rvoip_erlang_bridge::node::tcp::NodeSettings;
use rvoip_erlang_bridge::node::{BincodeCodec, RefGenerator, TcpConnector, TcpNodeConnection};
use rvoip_erlang_bridge::prelude::*;
use serial_test::serial;

const CONTROLLER: &str = "ctl@local";

fn loopback_config() -> BridgeConfig {
    BridgeConfig {
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: 0,
        ..test_config()
    }
}

async fn connect_controller(bridge: &ErlangBridge, cookie: &str) -> Result<TcpNodeConnection> {
    let addr = bridge.start().await?;
    let settings = Arc::new(NodeSettings {
        local_node: CONTROLLER.to_string(),
        cookie: cookie.to_string(),
        version: 5,
        tick: Duration::from_secs(15),
        codec: Arc::new(BincodeCodec),
        refs: Arc::new(RefGenerator::with_creation(CONTROLLER, 1)),
    });
    let connector = TcpConnector::new(settings, HashMap::from([(bridge.node_name().to_string(), addr)]), 1);
    Ok(connector.connect(bridge.node_name()).await?)
}

/// Next application message, skipping ticks and links
async fn next_message(conn: &TcpNodeConnection) -> Result<Term> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(message) = conn.receive(Duration::from_millis(50)).await? {
            if let Some(term) = message.message() {
                return Ok(term.clone());
            }
        }
    }
    Err(anyhow!("no message within {:?}", WAIT))
}

#[tokio::test]
#[serial]
async fn test_controller_round_trip_over_tcp() -> Result<()> {
    let engine = MockEngine::new();
    engine.add_command("status", "UP");
    let config = loopback_config();
    setup_logging(&config.logging)?;
    let bridge = new_bridge_with(&engine, config);

    let conn = connect_controller(&bridge, "ClueCon").await?;
    assert_eq!(conn.peer_node(), bridge.node_name());

    conn.reg_send("erlang_bridge", Term::tuple(vec![Term::atom("api"), Term::atom("status"), text("")]))
        .await?;
    assert_eq!(next_message(&conn).await?, Term::tuple(vec![Term::atom("ok"), text("UP")]));

    assert!(wait_until(|| bridge.listener_for_node(CONTROLLER).is_some()).await);
    assert_eq!(bridge.console("listeners"), format!("Listener to {} with 0 outbound sessions\n", CONTROLLER));

    conn.close().await;
    assert!(wait_until(|| bridge.registry().is_empty()).await);
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_wrong_cookie_is_refused() -> Result<()> {
    let engine = MockEngine::new();
    let bridge = new_bridge_with(&engine, loopback_config());

    let result = connect_controller(&bridge, "not-the-cookie").await;
    assert!(result.is_err());
    assert!(bridge.registry().is_empty());
    bridge.shutdown().await;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_address_outside_acl_is_denied() -> Result<()> {
    let engine = MockEngine::new();
    let mut config = loopback_config();
    config.apply_inbound_acl = vec!["10.0.0.0/8".to_string()];
    let bridge = new_bridge_with(&engine, config);

    let conn = connect_controller(&bridge, "ClueCon").await?;
    conn.reg_send("erlang_bridge", Term::atom("getpid")).await?;
    assert_eq!(next_message(&conn).await?, Term::error("acldeny"));
    assert!(bridge.registry().is_empty());
    bridge.shutdown().await;
    Ok(())
}

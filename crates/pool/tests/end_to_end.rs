//! End-to-end scenarios, spec §8: two in-process pools talking over real
//! loopback TCP through the reference plaintext transport/authenticator and
//! atomic scheduler (the only pieces of TRANSPORT/SCHEDULER this crate
//! ships, per spec §1).
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pool::message::{CodecRegistry, JsonCodec};
use pool::{AtomicScheduler, Handle, PlaintextAuthenticator, PoolConfig};

const USER_TAG: u8 = 0x10;

fn identity(byte: u8) -> pool::config::Identity {
    pool::config::Identity {
        public_id: vec![byte; 8],
        pow_stamp: vec![1],
    }
}

fn config(byte: u8, min: usize, max: usize, max_incoming: usize) -> PoolConfig {
    PoolConfig {
        identity: identity(byte),
        proof_of_work_target: 0,
        trusted_points: Vec::new(),
        peers_file: None,
        closed_network: false,
        listening_port: None,
        min_connections: min,
        max_connections: max,
        max_incoming_connections: max_incoming,
        connection_timeout_secs: 5,
        authentication_timeout_secs: 5,
        incoming_app_message_queue_size: None,
        incoming_message_queue_size: 64,
        outgoing_message_queue_size: 64,
        known_peer_ids_history_size: 50,
        known_points_history_size: 50,
        max_known_points: None,
        max_known_peer_ids: None,
        swap_linger_secs: 30,
        binary_chunks_size: 65_536,
        message: Default::default(),
        meta: Default::default(),
    }
}

fn codecs() -> CodecRegistry {
    let mut registry = CodecRegistry::new();
    registry.register(Box::new(JsonCodec::<String>::new(USER_TAG, Some(4096))));
    registry
}

/// Spin up a pool, bind a listener, and spawn the accept loop. Returns the
/// handle plus the address other nodes should dial.
async fn spawn_node(config: PoolConfig) -> (Handle, SocketAddr) {
    let handle = Handle::create(
        config,
        Arc::new(PlaintextAuthenticator::new(65_536)),
        Arc::new(AtomicScheduler::new()),
        codecs(),
    )
    .await
    .expect("pool creation must not fail");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_handle = handle.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer_addr)) = listener.accept().await else {
                break;
            };
            accept_handle.accept(stream, peer_addr).await;
        }
    });

    (handle, addr)
}

/// Scenario 1: a successful handshake yields a Running connection on both
/// sides, `active_connections() == 1`, and a user message written on one
/// side is read back on the other.
#[tokio::test]
async fn handshake_then_user_message_round_trips() {
    let (x, _x_addr) = spawn_node(config(1, 1, 2, 10)).await;
    let (y, y_addr) = spawn_node(config(2, 1, 2, 10)).await;

    let (accepted_tx, accepted_rx) = flume::bounded(1);
    y.on_new_connection(move |conn| {
        let _ = accepted_tx.try_send(conn);
    });

    let x_to_y = x.connect(y_addr, None).await.expect("X must connect to Y");
    let y_side = accepted_rx
        .recv_async()
        .await
        .expect("Y must observe the inbound connection");

    assert_eq!(x.active_connections().await, 1);
    assert_eq!(y.active_connections().await, 1);

    x_to_y
        .write(USER_TAG, &"hi".to_string())
        .await
        .expect("write must succeed");

    let message = tokio::time::timeout(Duration::from_secs(1), y_side.read())
        .await
        .expect("Y must receive the message before the timeout")
        .expect("the connection must not have closed");
    assert_eq!(message.tag, USER_TAG);
    let payload: String = message.downcast().map_err(|_| ()).expect("payload must be a String");
    assert_eq!(payload, "hi");

    x.destroy().await;
    y.destroy().await;
}

/// Scenario 2: once `max_connections` is reached, a further inbound
/// handshake is rejected and the dialer observes `Connection_refused`.
#[tokio::test]
async fn too_many_connections_rejects_the_next_dial() {
    let (x, x_addr) = spawn_node(config(10, 1, 1, 10)).await;
    let (y, _y_addr) = spawn_node(config(11, 1, 2, 10)).await;
    let (z, _z_addr) = spawn_node(config(12, 1, 2, 10)).await;

    y.connect(x_addr, None).await.expect("Y must connect to X first");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(x.active_connections().await, 1);

    // X's inbound side rejects at phase 1 (before any handshake bytes are
    // exchanged) and drops the socket; Z observes this as a failed dial
    // one way or another, never as a successful connect.
    let result = z.connect(x_addr, Some(Duration::from_millis(500))).await;
    assert!(result.is_err());

    x.destroy().await;
    y.destroy().await;
    z.destroy().await;
}

/// Scenario 3: in a closed network, dialing an untrusted point is
/// rejected outright while a trusted point still succeeds.
#[tokio::test]
async fn closed_network_rejects_untrusted_points() {
    let (y, y_addr) = spawn_node(config(20, 1, 2, 10)).await;

    let mut x_config = config(21, 1, 2, 10);
    x_config.closed_network = true;
    x_config.trusted_points = vec![y_addr];
    let (x, _x_addr) = spawn_node(x_config).await;

    let untrusted: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let untrusted_result = x.connect(untrusted, Some(Duration::from_millis(200))).await;
    assert!(untrusted_result.is_err());

    let trusted_result = x.connect(y_addr, None).await;
    assert!(trusted_result.is_ok());

    x.destroy().await;
    y.destroy().await;
}

/// `disconnect; disconnect` is idempotent (spec §8 laws).
#[tokio::test]
async fn disconnect_is_idempotent() {
    let (x, _x_addr) = spawn_node(config(30, 1, 2, 10)).await;
    let (y, y_addr) = spawn_node(config(31, 1, 2, 10)).await;

    let connection = x.connect(y_addr, None).await.unwrap();
    connection.disconnect(true).await;
    connection.disconnect(true).await;
    assert!(connection.is_disconnecting());

    x.destroy().await;
    y.destroy().await;
}

//! Handshake and session lifecycle over real loopback sockets.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use tether::replication::{EntitySpawnContext, NetworkEntityFactory};
use tether::{
    Client, ClientConfig, ClientState, DisconnectReason, Message, MessageBody, MessageFlags,
    NetError, NetworkPacket, PeerConfig, PeerEvent, ReadBuffer, Server, ServerConfig, WriteBuffer,
    MAX_PACKET_SIZE,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TICK: f32 = 0.05;

/// `RUST_LOG=trace cargo test` surfaces protocol traces on failures.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Does nothing; connection tests never replicate entities.
struct NoopFactory;

impl NetworkEntityFactory for NoopFactory {
    fn create_entity(&mut self, _ctx: EntitySpawnContext<'_>) -> u64 {
        0
    }

    fn destroy_entity(&mut self, _local_id: u64) {}
}

fn server_on(port: u16, max_connections: usize) -> Server {
    init_logging();
    let mut server = Server::new(ServerConfig {
        peer: PeerConfig {
            max_connections,
            ..PeerConfig::default()
        },
        port,
    });
    server.start().expect("server bind failed");
    server
}

fn connect_client(port: u16) -> Client {
    let mut client = Client::new(ClientConfig::default());
    client
        .connect(format!("127.0.0.1:{port}"))
        .expect("client bind failed");
    client
}

/// Ticks both endpoints until `done` holds or the tick budget runs out.
fn pump_until(
    server: &mut Server,
    clients: &mut [&mut Client],
    max_ticks: usize,
    mut done: impl FnMut(&Server, &[&mut Client]) -> bool,
) -> bool {
    let mut factory = NoopFactory;
    for _ in 0..max_ticks {
        server.tick(TICK);
        for client in clients.iter_mut() {
            client.tick(TICK, &mut factory);
        }
        if done(server, clients) {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn drain_events(poll: &mut impl FnMut() -> Option<PeerEvent>) -> Vec<PeerEvent> {
    std::iter::from_fn(poll).collect()
}

#[test]
fn client_reaches_connected_against_responsive_server() {
    let port = next_port();
    let mut server = server_on(port, 4);
    let mut client = connect_client(port);

    let connected = pump_until(&mut server, &mut [&mut client], 200, |server, clients| {
        clients[0].is_connected() && server.connected_count() == 1
    });
    assert!(connected, "handshake did not complete");

    let client_events = drain_events(&mut || client.poll_event());
    assert!(client_events
        .iter()
        .any(|e| matches!(e, PeerEvent::LocalConnected { .. })));

    let server_events = drain_events(&mut || server.poll_event());
    assert!(server_events
        .iter()
        .any(|e| matches!(e, PeerEvent::RemoteConnected { .. })));
}

#[test]
fn extra_client_is_denied_when_server_is_full() {
    let port = next_port();
    let mut server = server_on(port, 1);
    let mut first = connect_client(port);

    assert!(pump_until(
        &mut server,
        &mut [&mut first],
        200,
        |_, clients| clients[0].is_connected()
    ));

    let mut second = connect_client(port);
    let denied = pump_until(
        &mut server,
        &mut [&mut first, &mut second],
        200,
        |_, clients| clients[1].state() == ClientState::Disconnected,
    );
    assert!(denied, "second client was never turned away");

    let events = drain_events(&mut || second.poll_event());
    assert!(events.iter().any(|e| matches!(
        e,
        PeerEvent::LocalDisconnected {
            reason: DisconnectReason::ServerFull
        }
    )));
    assert!(first.is_connected());
    assert_eq!(server.connected_count(), 1);
}

/// Hand-rolls the handshake on a raw socket so the challenge response can
/// carry a bogus prefix.
#[test]
fn wrong_prefix_in_challenge_response_never_connects() {
    let port = next_port();
    let mut server = server_on(port, 4);

    let socket = UdpSocket::bind("127.0.0.1:0").expect("raw socket bind");
    socket
        .set_read_timeout(Some(Duration::from_millis(20)))
        .expect("set timeout");
    let server_addr = format!("127.0.0.1:{port}");

    let client_salt = 0xDEAD_BEEF_u64;
    send_single(
        &socket,
        &server_addr,
        MessageBody::ConnectionRequest { client_salt },
    );

    let mut server_salt = None;
    for _ in 0..50 {
        server.tick(TICK);
        if let Some(message) = recv_single(&socket) {
            if let MessageBody::ConnectionChallenge {
                client_salt: cs,
                server_salt: ss,
            } = message.body
            {
                assert_eq!(cs, client_salt);
                server_salt = Some(ss);
                break;
            }
        }
    }
    let server_salt = server_salt.expect("no challenge received");

    let wrong_prefix = (client_salt ^ server_salt) ^ 1;
    for _ in 0..50 {
        send_single(
            &socket,
            &server_addr,
            MessageBody::ConnectionChallengeResponse {
                prefix: wrong_prefix,
            },
        );
        server.tick(TICK);
        assert_eq!(server.connected_count(), 0);
    }
}

#[test]
fn explicit_disconnect_reaches_the_server() {
    let port = next_port();
    let mut server = server_on(port, 4);
    let mut client = connect_client(port);

    assert!(pump_until(
        &mut server,
        &mut [&mut client],
        200,
        |_, clients| clients[0].is_connected()
    ));
    drain_events(&mut || server.poll_event());

    client.disconnect();
    assert_eq!(client.state(), ClientState::Disconnected);

    let mut saw_disconnect = false;
    for _ in 0..200 {
        server.tick(TICK);
        while let Some(event) = server.poll_event() {
            if matches!(
                event,
                PeerEvent::RemoteDisconnected {
                    reason: DisconnectReason::Shutdown,
                    ..
                }
            ) {
                saw_disconnect = true;
            }
        }
        if saw_disconnect {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(saw_disconnect, "server never learned of the disconnect");
    assert_eq!(server.connected_count(), 0);
}

#[test]
fn silent_client_is_dropped_after_inactivity_timeout() {
    let port = next_port();
    let mut server = server_on(port, 4);
    let mut client = connect_client(port);

    assert!(pump_until(
        &mut server,
        &mut [&mut client],
        200,
        |_, clients| clients[0].is_connected()
    ));
    drain_events(&mut || server.poll_event());

    // Client goes silent; feed the server big synthetic deltas.
    let mut timed_out = false;
    for _ in 0..10 {
        server.tick(1.0);
        while let Some(event) = server.poll_event() {
            if matches!(
                event,
                PeerEvent::RemoteDisconnected {
                    reason: DisconnectReason::Timeout,
                    ..
                }
            ) {
                timed_out = true;
            }
        }
        if timed_out {
            break;
        }
    }
    assert!(timed_out, "inactive client was never dropped");
    assert_eq!(server.connected_count(), 0);
}

#[test]
fn inputs_blob_surfaces_as_a_server_event() {
    let port = next_port();
    let mut server = server_on(port, 4);
    let mut client = connect_client(port);

    assert!(pump_until(
        &mut server,
        &mut [&mut client],
        200,
        |_, clients| clients[0].is_connected()
    ));

    client
        .send_inputs(b"jump", MessageFlags::RELIABLE | MessageFlags::ORDERED)
        .expect("send_inputs while connected");

    let mut received = None;
    let mut factory = NoopFactory;
    for _ in 0..200 {
        server.tick(TICK);
        client.tick(TICK, &mut factory);
        while let Some(event) = server.poll_event() {
            if let PeerEvent::InputsReceived { data, .. } = event {
                received = Some(data);
            }
        }
        if received.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(received.as_deref(), Some(b"jump".as_slice()));
}

#[test]
fn send_inputs_without_a_socket_reports_not_running() {
    init_logging();
    let mut client = Client::new(ClientConfig::default());
    let err = client
        .send_inputs(b"jump", MessageFlags::RELIABLE)
        .unwrap_err();
    assert!(matches!(err, NetError::NotRunning));
}

#[test]
fn server_stop_notifies_connected_clients() {
    let port = next_port();
    let mut server = server_on(port, 4);
    let mut client = connect_client(port);

    assert!(pump_until(
        &mut server,
        &mut [&mut client],
        200,
        |_, clients| clients[0].is_connected()
    ));
    drain_events(&mut || client.poll_event());

    server.stop();
    assert!(!server.is_running());

    let mut factory = NoopFactory;
    let mut shut_down = false;
    for _ in 0..200 {
        client.tick(TICK, &mut factory);
        while let Some(event) = client.poll_event() {
            if matches!(
                event,
                PeerEvent::LocalDisconnected {
                    reason: DisconnectReason::Shutdown
                }
            ) {
                shut_down = true;
            }
        }
        if shut_down {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert!(shut_down, "client never learned the server shut down");
    assert_eq!(client.state(), ClientState::Disconnected);
}

fn send_single(socket: &UdpSocket, server_addr: &str, body: MessageBody) {
    let message = Message {
        sequence: 0,
        flags: MessageFlags::empty(),
        body,
    };
    let mut packet = NetworkPacket::new(0, 0, 0);
    packet.push(message);
    let mut buffer = WriteBuffer::with_capacity(MAX_PACKET_SIZE);
    packet.write(&mut buffer).expect("packet encode");
    socket
        .send_to(buffer.as_slice(), server_addr)
        .expect("raw send");
}

fn recv_single(socket: &UdpSocket) -> Option<Message> {
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let (len, _) = socket.recv_from(&mut buf).ok()?;
    let mut reader = ReadBuffer::new(&buf[..len]);
    let packet = NetworkPacket::read(&mut reader).ok()?;
    packet.into_messages().into_iter().next()
}

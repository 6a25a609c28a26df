//! End-to-end entity replication between a live server and client.

use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use tether::replication::{EntitySpawnContext, NetworkEntityFactory};
use tether::{Client, ClientConfig, PeerConfig, Server, ServerConfig, VariableId};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(43000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TICK: f32 = 0.05;

/// `RUST_LOG=trace cargo test` surfaces protocol traces on failures.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records every spawn and registers one "health" variable per entity, the
/// way a game world adapter would.
#[derive(Default)]
struct WorldFactory {
    next_local: u64,
    spawns: Vec<(u32, (f32, f32))>,
    destroyed: Vec<u64>,
    health_vars: Vec<VariableId>,
}

impl NetworkEntityFactory for WorldFactory {
    fn create_entity(&mut self, ctx: EntitySpawnContext<'_>) -> u64 {
        self.health_vars
            .push(ctx.variables.register(ctx.network_id, 100.0));
        self.spawns.push((ctx.class_id, ctx.position));
        self.next_local += 1;
        self.next_local
    }

    fn destroy_entity(&mut self, local_id: u64) {
        self.destroyed.push(local_id);
    }
}

fn start_pair(port: u16) -> (Server, Client) {
    init_logging();
    let mut server = Server::new(ServerConfig {
        peer: PeerConfig::default(),
        port,
    });
    server.start().expect("server bind failed");
    let mut client = Client::new(ClientConfig::default());
    client
        .connect(format!("127.0.0.1:{port}"))
        .expect("client bind failed");
    (server, client)
}

fn pump(server: &mut Server, client: &mut Client, factory: &mut WorldFactory, ticks: usize) {
    for _ in 0..ticks {
        server.tick(TICK);
        client.tick(TICK, factory);
        thread::sleep(Duration::from_millis(1));
    }
}

fn pump_until_connected(server: &mut Server, client: &mut Client, factory: &mut WorldFactory) {
    for _ in 0..200 {
        server.tick(TICK);
        client.tick(TICK, factory);
        if client.is_connected() {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!("handshake did not complete");
}

#[test]
fn entity_created_after_connect_appears_on_the_client() {
    let port = next_port();
    let (mut server, mut client) = start_pair(port);
    let mut server_world = WorldFactory::default();
    let mut client_world = WorldFactory::default();
    pump_until_connected(&mut server, &mut client, &mut client_world);

    let id = server.create_entity(7, 0, 3.0, -1.5, &mut server_world);
    pump(&mut server, &mut client, &mut client_world, 50);

    assert!(client.replication().contains_entity(id));
    assert_eq!(client_world.spawns, vec![(7, (3.0, -1.5))]);
}

#[test]
fn late_joiner_receives_the_existing_world() {
    init_logging();
    let port = next_port();
    let mut server = Server::new(ServerConfig {
        peer: PeerConfig::default(),
        port,
    });
    server.start().expect("server bind failed");
    let mut server_world = WorldFactory::default();

    let id = server.create_entity(2, 0, 8.0, 9.0, &mut server_world);
    // Mutate the entity before anyone is listening.
    let health = server_world.health_vars[0];
    server.replication_mut().variables_mut().set(health, 40.0);
    for _ in 0..10 {
        server.tick(TICK);
    }

    let mut client = Client::new(ClientConfig::default());
    client
        .connect(format!("127.0.0.1:{port}"))
        .expect("client bind failed");
    let mut client_world = WorldFactory::default();
    pump_until_connected(&mut server, &mut client, &mut client_world);
    pump(&mut server, &mut client, &mut client_world, 50);

    assert!(client.replication().contains_entity(id));
    assert_eq!(client_world.spawns, vec![(2, (8.0, 9.0))]);
    let client_health = client_world.health_vars[0];
    assert_eq!(client.replication().variables().get(client_health), Some(40.0));
}

/// Entities created and destroyed before the join leave the server's variable
/// ids ahead of a fresh client's; deltas must still land correctly.
#[test]
fn late_joiner_after_churn_sees_fresh_deltas() {
    init_logging();
    let port = next_port();
    let mut server = Server::new(ServerConfig {
        peer: PeerConfig::default(),
        port,
    });
    server.start().expect("server bind failed");
    let mut server_world = WorldFactory::default();

    let scrapped = server.create_entity(1, 0, 0.0, 0.0, &mut server_world);
    server.remove_entity(scrapped, &mut server_world);
    let id = server.create_entity(3, 0, 1.0, 1.0, &mut server_world);
    for _ in 0..10 {
        server.tick(TICK);
    }

    let mut client = Client::new(ClientConfig::default());
    client
        .connect(format!("127.0.0.1:{port}"))
        .expect("client bind failed");
    let mut client_world = WorldFactory::default();
    pump_until_connected(&mut server, &mut client, &mut client_world);
    pump(&mut server, &mut client, &mut client_world, 50);
    assert!(client.replication().contains_entity(id));

    let server_health = server_world.health_vars[1];
    server
        .replication_mut()
        .variables_mut()
        .set(server_health, 42.0);
    pump(&mut server, &mut client, &mut client_world, 50);

    let client_health = client_world.health_vars[0];
    assert_eq!(client.replication().variables().get(client_health), Some(42.0));
}

#[test]
fn variable_change_reaches_the_client_exactly() {
    let port = next_port();
    let (mut server, mut client) = start_pair(port);
    let mut server_world = WorldFactory::default();
    let mut client_world = WorldFactory::default();
    pump_until_connected(&mut server, &mut client, &mut client_world);

    server.create_entity(1, 0, 0.0, 0.0, &mut server_world);
    pump(&mut server, &mut client, &mut client_world, 50);

    let server_health = server_world.health_vars[0];
    let client_health = client_world.health_vars[0];
    assert_eq!(client.replication().variables().get(client_health), Some(100.0));

    server
        .replication_mut()
        .variables_mut()
        .set(server_health, 55.5);
    pump(&mut server, &mut client, &mut client_world, 50);

    assert_eq!(client.replication().variables().get(client_health), Some(55.5));
    // Only one spawn ever happened despite the update traffic.
    assert_eq!(client_world.spawns.len(), 1);
}

#[test]
fn destroy_removes_the_client_mirror() {
    let port = next_port();
    let (mut server, mut client) = start_pair(port);
    let mut server_world = WorldFactory::default();
    let mut client_world = WorldFactory::default();
    pump_until_connected(&mut server, &mut client, &mut client_world);

    let id = server.create_entity(1, 0, 0.0, 0.0, &mut server_world);
    pump(&mut server, &mut client, &mut client_world, 50);
    assert!(client.replication().contains_entity(id));

    server.remove_entity(id, &mut server_world);
    pump(&mut server, &mut client, &mut client_world, 50);

    assert!(!client.replication().contains_entity(id));
    assert_eq!(client_world.destroyed.len(), 1);
    assert_eq!(server_world.destroyed.len(), 1);
}

//! Headless demo: a server that spawns a few moving entities and clients
//! that mirror them, all over loopback by default.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::info;

use tether::replication::{EntitySpawnContext, NetworkEntityFactory};
use tether::{
    Client, ClientConfig, MessageFlags, PeerEvent, Server, ServerConfig, VariableId,
    DEFAULT_SERVER_PORT,
};

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
}

#[derive(Parser)]
#[command(name = "tether-demo")]
#[command(about = "Headless tether transport demo")]
struct Args {
    #[arg(short, long, value_enum)]
    mode: Mode,

    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(long, default_value_t = 30, help = "Seconds to run before exiting")]
    duration: u64,
}

/// Minimal game world: entities are just ids, each with an "energy" variable.
#[derive(Default)]
struct DemoWorld {
    next_local: u64,
    energy_vars: Vec<VariableId>,
}

impl NetworkEntityFactory for DemoWorld {
    fn create_entity(&mut self, ctx: EntitySpawnContext<'_>) -> u64 {
        self.energy_vars
            .push(ctx.variables.register(ctx.network_id, 0.0));
        self.next_local += 1;
        info!(
            "entity {} spawned (class {}) at {:?}",
            ctx.network_id, ctx.class_id, ctx.position
        );
        self.next_local
    }

    fn destroy_entity(&mut self, local_id: u64) {
        info!("local entity {local_id} destroyed");
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let dt = 1.0 / args.tick_rate as f32;
    let tick = Duration::from_secs_f32(dt);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    match args.mode {
        Mode::Server => run_server(&args, dt, tick, deadline),
        Mode::Client => run_client(&args, dt, tick, deadline),
    }
}

fn run_server(args: &Args, dt: f32, tick: Duration, deadline: Instant) -> Result<()> {
    let mut world = DemoWorld::default();
    let mut server = Server::new(ServerConfig {
        port: args.port,
        ..ServerConfig::default()
    });
    server.start()?;

    server.create_entity(1, 0, 0.0, 0.0, &mut world);
    server.create_entity(1, 0, 10.0, -10.0, &mut world);

    let mut elapsed = 0.0f32;
    while Instant::now() < deadline {
        let frame_start = Instant::now();
        elapsed += dt;

        // Wiggle each entity's energy so clients see steady delta traffic.
        for (i, var) in world.energy_vars.iter().enumerate() {
            let value = (elapsed + i as f32).sin() * 50.0;
            server.replication_mut().variables_mut().set(*var, value);
        }

        server.tick(dt);
        while let Some(event) = server.poll_event() {
            log_event("server", &event);
        }

        sleep_rest(frame_start, tick);
    }

    let stats = server.stats();
    info!(
        "server done: {} packets out, {} packets in",
        stats.packets_sent, stats.packets_received
    );
    server.stop();
    Ok(())
}

fn run_client(args: &Args, dt: f32, tick: Duration, deadline: Instant) -> Result<()> {
    let mut world = DemoWorld::default();
    let mut client = Client::new(ClientConfig::default());
    client.connect(format!("{}:{}", args.address, args.port))?;

    let mut since_report = 0.0f32;
    while Instant::now() < deadline {
        let frame_start = Instant::now();

        client.tick(dt, &mut world);
        while let Some(event) = client.poll_event() {
            log_event("client", &event);
        }

        if client.is_connected() {
            client.send_inputs(b"ping", MessageFlags::empty())?;
            since_report += dt;
            if since_report >= 2.0 {
                since_report = 0.0;
                report(&client, &world);
            }
        }

        sleep_rest(frame_start, tick);
    }

    if client.is_connected() {
        client.disconnect();
    }
    Ok(())
}

fn report(client: &Client, world: &DemoWorld) {
    let stats = client.stats();
    info!(
        "mirroring {} entities, rtt {:.1} ms, server clock {:.0} ms",
        client.replication().entity_count(),
        stats.rtt_ms,
        client.server_time_ms()
    );
    for var in &world.energy_vars {
        if let Some(value) = client.replication().variables().get(*var) {
            info!("  energy[{var}] = {value:.1}");
        }
    }
}

fn log_event(side: &str, event: &PeerEvent) {
    match event {
        PeerEvent::LocalConnected { client_index } => {
            info!("{side}: connected as index {client_index}")
        }
        PeerEvent::LocalDisconnected { reason } => {
            info!("{side}: disconnected ({})", reason.as_str())
        }
        PeerEvent::RemoteConnected { peer_id, addr } => {
            info!("{side}: peer {peer_id} joined from {addr}")
        }
        PeerEvent::RemoteDisconnected { peer_id, reason } => {
            info!("{side}: peer {peer_id} left ({})", reason.as_str())
        }
        PeerEvent::InputsReceived { peer_id, data } => {
            info!("{side}: {} input bytes from peer {peer_id}", data.len())
        }
    }
}

fn sleep_rest(frame_start: Instant, tick: Duration) {
    let spent = frame_start.elapsed();
    if spent < tick {
        thread::sleep(tick - spent);
    }
}

//! Tuning knobs for peers. Defaults suit a LAN demo game.

pub const DEFAULT_SERVER_PORT: u16 = 30501;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub max_connections: usize,
    /// Seconds without an authenticated datagram before a peer is dropped.
    pub inactivity_timeout_secs: f32,
    /// Seconds an unfinished handshake may sit before it is abandoned.
    pub handshake_timeout_secs: f32,
    /// Cadence at which an unanswered handshake message is resent.
    pub handshake_resend_secs: f32,
    /// Messages pre-allocated per kind in the pool.
    pub pool_messages_per_kind: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            inactivity_timeout_secs: 5.0,
            handshake_timeout_secs: 5.0,
            handshake_resend_secs: 0.25,
            pool_messages_per_kind: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub peer: PeerConfig,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer: PeerConfig,
    /// Seconds between time-sync requests once connected.
    pub time_sync_interval_secs: f32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            // A client only ever talks to the one server.
            peer: PeerConfig {
                max_connections: 1,
                ..PeerConfig::default()
            },
            time_sync_interval_secs: 2.0,
        }
    }
}

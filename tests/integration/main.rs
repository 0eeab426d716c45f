//! chatwire integration test harness.
//!
//! Runs a client and a server `Transport` against each other through
//! in-memory chat channels. `Link::pump` plays the chat system: it drains
//! whatever each side emitted and delivers it to the other, so tests can
//! reorder, drop, duplicate, or corrupt frames on the way.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=chatwire_net=debug to watch the transport's logs.

use std::sync::{Arc, Mutex, Once};

use chatwire_core::codec::{Codec, CodecError};
use chatwire_core::config::ChatwireConfig;
use chatwire_net::{
    Inbound, Packet, PeerId, RecordingChannel, Registry, Role, SentFrame, Transport,
};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

mod failures;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Platform id the server sees for the test client.
pub const CLIENT_PEER: PeerId = PeerId(76561198000000001);
/// Platform id the client sees for the server.
pub const SERVER_PEER: PeerId = PeerId(1);

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A connected client/server pair.
pub struct Link {
    pub client: Transport,
    pub client_out: Arc<RecordingChannel>,
    pub server: Transport,
    pub server_out: Arc<RecordingChannel>,
}

impl Link {
    pub fn new() -> Self {
        Self::with_config(ChatwireConfig::default())
    }

    pub fn with_config(config: ChatwireConfig) -> Self {
        init_tracing();
        let (client, client_out) = endpoint(Role::Client, config.clone());
        let (server, server_out) = endpoint(Role::Server, config);
        Self {
            client,
            client_out,
            server,
            server_out,
        }
    }

    /// Frames the client has emitted since the last drain.
    pub fn from_client(&self) -> Vec<SentFrame> {
        self.client_out.drain()
    }

    /// Frames the server has emitted since the last drain.
    pub fn from_server(&self) -> Vec<SentFrame> {
        self.server_out.drain()
    }

    /// Deliver everything in flight, in order, both ways.
    pub fn pump(&self) -> Vec<Inbound> {
        let mut outcomes: Vec<Inbound> = self
            .from_client()
            .iter()
            .map(|f| self.server.on_receive(CLIENT_PEER, &f.text))
            .collect();
        outcomes.extend(
            self.from_server()
                .iter()
                .map(|f| self.client.on_receive(SERVER_PEER, &f.text)),
        );
        outcomes
    }
}

pub fn endpoint(role: Role, config: ChatwireConfig) -> (Transport, Arc<RecordingChannel>) {
    let out = Arc::new(RecordingChannel::new());
    let transport = Transport::new(role, config, Arc::new(Registry::new()), out.clone())
        .expect("default config is valid");
    (transport, out)
}

/// Handler that records every value it receives.
pub fn collector<T: Send + 'static>() -> (
    Arc<Mutex<Vec<T>>>,
    impl Fn(&PeerId, T) -> anyhow::Result<()> + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |_: &PeerId, value: T| {
        sink.lock().unwrap().push(value);
        Ok(())
    })
}

pub fn dispatched(outcomes: &[Inbound]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, Inbound::Dispatched { .. }))
        .count()
}

// ── Payload types ─────────────────────────────────────────────────────────────

/// Client asks for a latency probe.
#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Ping {
    pub client_ticks: i64,
}

impl Packet for Ping {
    fn codec() -> Result<Codec<Self>, CodecError> {
        Codec::fixed()
    }
}

/// Server echoes the probe back with its own clock.
#[derive(Debug, Clone, Copy, PartialEq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct Pong {
    pub client_ticks: i64,
    pub server_ticks: i64,
}

impl Packet for Pong {
    fn codec() -> Result<Codec<Self>, CodecError> {
        Codec::fixed()
    }
}

/// A variable-length structured payload; keys travel as camelCase.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Scoreboard {
    pub map_name: String,
    pub rows: Vec<ScoreRow>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScoreRow {
    pub player_name: String,
    pub kills: u32,
    pub deaths: u32,
}

impl Packet for Scoreboard {
    fn codec() -> Result<Codec<Self>, CodecError> {
        Ok(Codec::structured())
    }
}

impl Scoreboard {
    /// A board large enough to need several frames.
    pub fn sample(players: usize) -> Self {
        Self {
            map_name: "de_überpass".into(),
            rows: (0..players)
                .map(|i| ScoreRow {
                    player_name: format!("player-{i:03}-ñ"),
                    kills: i as u32 * 3,
                    deaths: i as u32,
                })
                .collect(),
        }
    }
}

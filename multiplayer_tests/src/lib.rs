// Test-only game host and players for multiplayer integration tests.
//
// Wraps the real `ServerConnection` and `ClientConnection` (from
// `boardlink_net`) around a tiny lock-step game, `TallyBoard`, to exercise
// the full pipeline:
// host → join → player names → state broadcast → barrier → client move →
// acknowledge → relay → barrier → identical boards everywhere.
//
// The game travels as JSON through `JsonGameCodec`, the same seam a real
// game engine uses. The only test-specific code here is the bounded polling
// (every wait gives up after `POLL_TIMEOUT` through a `PlayerActivity`
// deadline) and the `expect`s that turn failures into test panics.
//
// See also: `tests/full_pipeline.rs` for the integration test scenarios.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use boardlink_net::{ClientConnection, ClientMove, NetConfig, NetError, ServerConnection};
use boardlink_protocol::{Category, ClientId, GameCodec, JsonGameCodec, PlayerEntry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Default timeout for blocking operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

const COLORS: [&str; 4] = ["red", "blue", "green", "yellow"];

static INIT_LOGGING: Once = Once::new();

/// Install a `tracing` subscriber that writes through the test harness.
/// `RUST_LOG` overrides the default debug filter for this harness and
/// `boardlink_net`. Safe to call from every test.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("boardlink_net=debug,multiplayer_tests=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_thread_names(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Network settings for loopback tests: OS-assigned port, fast polling.
pub fn test_config() -> NetConfig {
    NetConfig {
        bind_addr: "127.0.0.1".into(),
        port: 0,
        poll_interval_ms: 2,
        accept_poll_ms: 5,
        handshake_poll_limit: 2000,
        ..NetConfig::default()
    }
}

/// Poll `done` until it holds, panicking after `POLL_TIMEOUT`.
pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
        thread::sleep(POLL_INTERVAL);
    }
}

/// A `PlayerActivity` that stays active until `POLL_TIMEOUT` from now.
fn deadline() -> impl Fn() -> bool {
    let until = Instant::now() + POLL_TIMEOUT;
    move || Instant::now() < until
}

// ---------------------------------------------------------------------------
// The toy game
// ---------------------------------------------------------------------------

/// Shared game state: every player's running total plus the move history.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyBoard {
    pub round: u32,
    pub totals: BTreeMap<String, i64>,
    pub history: Vec<TallyMove>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyMove {
    pub player: String,
    pub amount: i64,
}

impl TallyBoard {
    pub fn new(players: &[PlayerEntry]) -> Self {
        Self {
            round: 0,
            totals: players.iter().map(|p| (p.name.clone(), 0)).collect(),
            history: Vec::new(),
        }
    }

    pub fn apply(&mut self, mv: &TallyMove) {
        *self.totals.entry(mv.player.clone()).or_default() += mv.amount;
        self.history.push(mv.clone());
    }
}

pub type TallyCodec = JsonGameCodec<TallyBoard, TallyMove>;

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// The authoritative side: owns the server connection and the real board.
pub struct TestHost {
    pub server: ServerConnection,
    pub board: TallyBoard,
    pub addr: SocketAddr,
    codec: TallyCodec,
}

impl TestHost {
    /// Start a server on a random port with `slots` accepting client slots.
    pub fn start(slots: usize) -> Self {
        init_test_logging();
        let server = ServerConnection::new(test_config());
        let addr = server.start_server().expect("start_server failed");
        for _ in 0..slots {
            server.add_client().expect("add_client failed");
        }
        info!(%addr, slots, "test host started");
        Self {
            server,
            board: TallyBoard::default(),
            addr,
            codec: TallyCodec::new(),
        }
    }

    pub fn await_players(&self, count: usize) {
        wait_until("players to connect", || {
            self.server.connected_count() == count
        });
    }

    /// Assign player slots in registry order, announce the names and reset
    /// the board for them. Returns the announced entries.
    pub fn announce_players(&mut self) -> Vec<PlayerEntry> {
        let mut players = Vec::new();
        for summary in self.server.clients() {
            self.server
                .set_slot(summary.index, players.len())
                .expect("set_slot failed");
            let color = COLORS[players.len() % COLORS.len()];
            players.push(PlayerEntry::new(summary.name, color));
        }
        self.server
            .send_player_names(&players)
            .expect("send_player_names failed");
        self.board = TallyBoard::new(&players);
        players
    }

    /// Start the next round: bump the round counter and broadcast the
    /// board. Follow with `await_acks(Category::State, None)` once the
    /// players had a chance to receive it.
    pub fn broadcast_board(&mut self) -> Result<(), NetError> {
        self.board.round += 1;
        debug!(round = self.board.round, "broadcasting board");
        let payload = self.codec.encode_state(&self.board)?;
        self.server.broadcast_state(payload)
    }

    /// The lock-step barrier for the last broadcast of `category`.
    pub fn await_acks(&self, category: Category, except: Option<usize>) -> Result<(), NetError> {
        self.server.wait_for_clients_game_ok(category, except)
    }

    /// Take one move from any player (acknowledging it), apply it and relay
    /// it to the others. Returns the move and the index of its sender, which
    /// the barrier on the relayed move must leave out.
    pub fn absorb_move(&mut self) -> Result<(TallyMove, Option<usize>), NetError> {
        let active = deadline();
        let ClientMove { from, payload } =
            self.server.wait_for_client_move_information(Some(&active))?;
        let mv = self.codec.decode_move(&payload)?;
        self.board.apply(&mv);
        let except = self.server.client_index(from);
        info!(client_id = %from, player = %mv.player, amount = mv.amount, "absorbed move");
        self.server.broadcast_move(payload, except)?;
        Ok((mv, except))
    }
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// A client-side player keeping its own replica of the board.
pub struct TestPlayer {
    pub client: ClientConnection,
    pub name: String,
    pub board: Option<TallyBoard>,
    pub players: Vec<PlayerEntry>,
    codec: TallyCodec,
}

impl TestPlayer {
    /// Connect and complete the handshake.
    pub fn join(addr: SocketAddr, name: &str) -> Self {
        Self::try_join(addr, name).expect("join failed")
    }

    pub fn try_join(addr: SocketAddr, name: &str) -> Result<Self, NetError> {
        init_test_logging();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr.to_string(), name)?;
        client.await_handshake()?;
        Ok(Self {
            client,
            name: name.to_string(),
            board: None,
            players: Vec::new(),
            codec: TallyCodec::new(),
        })
    }

    pub fn id(&self) -> Option<ClientId> {
        self.client.client_id()
    }

    pub fn await_player_names(&mut self) -> &[PlayerEntry] {
        let client = &self.client;
        let mut names = None;
        wait_until("player names", || {
            names = client.server_player_names();
            names.is_some()
        });
        self.players = names.unwrap_or_default();
        &self.players
    }

    /// Block until the next board arrives (acknowledging it) and replace
    /// the replica with it.
    pub fn receive_state(&mut self) -> Result<&TallyBoard, NetError> {
        let active = deadline();
        let payload = self
            .client
            .wait_for_server_game_information(Category::State, Some(&active))?;
        let board = self.codec.decode_state(&payload)?;
        Ok(self.board.insert(board))
    }

    /// Send a move. The replica is not touched; the next state broadcast
    /// carries the result.
    pub fn play(&self, amount: i64) -> Result<(), NetError> {
        let mv = TallyMove {
            player: self.name.clone(),
            amount,
        };
        self.client.send_move(self.codec.encode_move(&mv)?)
    }

    /// Wait for the host's game-ok for the last move sent.
    pub fn await_move_ack(&self) {
        let client = &self.client;
        wait_until("move acknowledged", || client.server_game_ok(Category::Move));
    }

    /// Block until another player's move is relayed and apply it to the
    /// replica.
    pub fn receive_move(&mut self) -> Result<TallyMove, NetError> {
        let active = deadline();
        let payload = self
            .client
            .wait_for_server_game_information(Category::Move, Some(&active))?;
        let mv = self.codec.decode_move(&payload)?;
        if let Some(board) = self.board.as_mut() {
            board.apply(&mv);
        }
        Ok(mv)
    }

    /// Send abort and close the connection.
    pub fn leave(&self) {
        self.client.close();
    }
}

// CLI entry point for boardlink.
//
// `serve` hosts a session: it opens N client slots, waits until every slot
// is connected, announces the players, then plays a few demo rounds, each a
// state broadcast followed by the game-ok barrier. `join` connects as one
// player and prints what the server sends until the session ends.
//
// Usage:
//   boardlink [--config <FILE>] [--port <PORT>] serve --clients <N> [--rounds <N>]
//   boardlink [--config <FILE>] [--port <PORT>] join --host <ADDR> --name <NAME>
//
// Logging goes through `tracing`; set `RUST_LOG` to override the default
// `boardlink=info` filter.

use std::path::PathBuf;
use std::process;

use boardlink_net::{ClientConnection, NetConfig, NetError, ServerConnection};
use boardlink_protocol::{Category, ConnectionState, GameCodec, JsonGameCodec, PlayerEntry};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const COLORS: [&str; 6] = ["red", "blue", "green", "yellow", "white", "black"];

#[derive(Parser)]
#[command(name = "boardlink", about = "Lock-step multiplayer session host and client")]
struct Cli {
    /// TOML file with network settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured port
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host a session and wait for players
    Serve {
        /// Number of client slots to open
        #[arg(long, default_value_t = 2)]
        clients: usize,

        /// Demo rounds to play once everyone is connected
        #[arg(long, default_value_t = 3)]
        rounds: u32,
    },
    /// Join a session as one player
    Join {
        /// Server host or ip:port
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Display name, unique within the session
        #[arg(long)]
        name: String,
    },
}

/// State relayed during the demo rounds.
#[derive(Debug, Serialize, Deserialize)]
struct DemoBoard {
    round: u32,
    players: Vec<String>,
}

type DemoCodec = JsonGameCodec<DemoBoard, String>;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("boardlink=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Serve { clients, rounds } => serve(config, clients, rounds),
        Command::Join { host, name } => join(config, &host, &name),
    };
    if let Err(e) = result {
        error!(error = %e, "session failed");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<NetConfig, NetError> {
    let mut config = match &cli.config {
        Some(path) => NetConfig::load(path)?,
        None => NetConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    Ok(config)
}

fn serve(config: NetConfig, clients: usize, rounds: u32) -> Result<(), NetError> {
    let poll = config.poll_interval();
    let server = ServerConnection::new(config);
    let addr = server.start_server()?;
    println!("Listening on {addr}, waiting for {clients} players");
    for _ in 0..clients {
        server.add_client()?;
    }

    // Slots whose handshake failed go back to accepting.
    while server.connected_count() < clients {
        for summary in server.clients() {
            if let (ConnectionState::Disconnected, Some(id)) = (summary.state, summary.id) {
                server.start_connecting(id)?;
            }
        }
        std::thread::sleep(poll);
    }

    let mut players = Vec::new();
    for summary in server.clients() {
        server.set_slot(summary.index, summary.index)?;
        let color = COLORS[summary.index % COLORS.len()];
        players.push(PlayerEntry::new(summary.name, color));
    }
    server.send_player_names(&players)?;
    info!(players = players.len(), "all players connected");

    let codec = DemoCodec::new();
    for round in 1..=rounds {
        let board = DemoBoard {
            round,
            players: players.iter().map(|p| p.name.clone()).collect(),
        };
        server.broadcast_state(codec.encode_state(&board)?)?;
        server.wait_for_clients_game_ok(Category::State, None)?;
        info!(round, "round acknowledged by every player");
    }

    server.close();
    println!("Session finished");
    Ok(())
}

fn join(config: NetConfig, host: &str, name: &str) -> Result<(), NetError> {
    let client = ClientConnection::new(config);
    client.start_client(host, name)?;
    let id = client.await_handshake()?;
    println!("Joined as {name} (id {id})");

    let codec = DemoCodec::new();
    loop {
        match client.wait_for_server_game_information(Category::State, None) {
            Ok(payload) => {
                if let Some(players) = client.server_player_names() {
                    for p in &players {
                        println!("Player {} plays {}", p.name, p.color);
                    }
                }
                match codec.decode_state(&payload) {
                    Ok(board) => println!("Round {}: {:?}", board.round, board.players),
                    Err(e) => warn!(error = %e, "undecodable state"),
                }
            }
            Err(NetError::Aborted | NetError::NotConnected) => {
                println!("Session ended by server");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

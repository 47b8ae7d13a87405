// Client role: one connection to the session server.
//
// Lifecycle: `Disconnected → Connecting → Connected`, back to `Disconnected`
// on any failure. `start_client()` returns immediately; the handshake runs
// on its own thread so the game engine never blocks on network latency:
//
//   1. TCP connect to the server, wrap the socket in a `LineLink`.
//   2. Send control/client-connect [application id, display name, address].
//   3. Poll the mailbox for control/server-accept [identity], giving up on
//      abort, name-exists, wrong-application, a dropped socket, or after
//      `handshake_poll_limit` iterations.
//   4. Store the identity, go `Connected`, send control/client-acknowledge.
//
// `await_handshake()` joins that thread for callers that want the outcome.
//
// After the handshake the game engine uses the blocking
// `wait_for_server_game_information()` to receive each state or move (it
// acknowledges with engine/game-ok automatically), and the non-blocking
// `server_*` queries for session setup messages.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use boardlink_protocol::{
    Category, ClientId, ConnectionState, Envelope, Message, NewGameInfo, PlayerEntry, Subtype,
};
use tracing::{debug, info, trace, warn};

use crate::config::NetConfig;
use crate::engine::{ConnectionEngine, Endpoint, PlayerActivity, spawn_reader};
use crate::error::NetError;
use crate::lock;
use crate::record::{ConnectionRecord, LineLink};

/// Error subtypes that end a handshake.
const HANDSHAKE_ERRORS: [Subtype; 3] = [
    Subtype::Abort,
    Subtype::NameExists,
    Subtype::WrongApplication,
];

struct ClientShared {
    config: NetConfig,
    engine: ConnectionEngine,
    record: Mutex<ConnectionRecord>,
}

/// Client side of a session. Dropping it closes the connection.
pub struct ClientConnection {
    shared: Arc<ClientShared>,
    handshake: Mutex<Option<JoinHandle<Result<ClientId, NetError>>>>,
}

impl ClientConnection {
    pub fn new(config: NetConfig) -> Self {
        let engine = ConnectionEngine::new(config.poll_interval());
        Self {
            shared: Arc::new(ClientShared {
                config,
                engine,
                record: Mutex::new(ConnectionRecord::new(None, 0, ConnectionState::Disconnected)),
            }),
            handshake: Mutex::new(None),
        }
    }

    /// Begin connecting to `server` as `display_name`.
    ///
    /// `server` is a host name or IP (the configured port is used) or a full
    /// `ip:port` address. Returns once the handshake thread is running.
    pub fn start_client(&self, server: &str, display_name: &str) -> Result<(), NetError> {
        if self.shared.engine.is_stopped() {
            return Err(NetError::Closed);
        }
        {
            let mut record = lock(&self.shared.record);
            if record.state.is_live() {
                return Err(NetError::Protocol("client is already connecting".into()));
            }
            record.reset();
            record.name = display_name.to_string();
            record.state = ConnectionState::Connecting;
        }
        self.shared.engine.mailbox().clear();
        spawn_reader(&self.shared, "boardlink-client-reader")?;

        let shared = Arc::clone(&self.shared);
        let server = server.to_string();
        let handle = thread::Builder::new()
            .name("boardlink-client-handshake".into())
            .spawn(move || {
                let result = shared.handshake(&server);
                if let Err(e) = &result {
                    warn!(server = %server, error = %e, "handshake failed");
                    lock(&shared.record).disconnect();
                }
                result
            })?;
        *lock(&self.handshake) = Some(handle);
        Ok(())
    }

    /// Wait for the handshake started by `start_client` to finish.
    pub fn await_handshake(&self) -> Result<ClientId, NetError> {
        let handle = lock(&self.handshake).take();
        match handle {
            Some(handle) => handle.join().unwrap_or(Err(NetError::Closed)),
            None => self.server_accepted().ok_or(NetError::NotConnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.record).state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        lock(&self.shared.record).id
    }

    pub fn display_name(&self) -> String {
        lock(&self.shared.record).name.clone()
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        lock(&self.shared.record).address
    }

    pub fn engine(&self) -> &ConnectionEngine {
        &self.shared.engine
    }

    // --- Non-blocking queries ---

    /// The identity the server assigned, once the handshake completed.
    pub fn server_accepted(&self) -> Option<ClientId> {
        let record = lock(&self.shared.record);
        match record.state {
            ConnectionState::Connected => record.id,
            _ => None,
        }
    }

    /// Whether the server sent an abort. The message stays queued.
    pub fn server_abort(&self) -> bool {
        self.shared
            .engine
            .has_message(Category::Error, Some(Subtype::Abort))
    }

    /// The rejection the server answered the handshake with, if any.
    pub fn server_rejection(&self) -> Option<Subtype> {
        [Subtype::NameExists, Subtype::WrongApplication]
            .into_iter()
            .find(|s| self.shared.engine.has_message(Category::Error, Some(*s)))
    }

    pub fn server_player_names(&self) -> Option<Vec<PlayerEntry>> {
        let msg = self
            .shared
            .engine
            .next_message(Category::Engine, Some(Subtype::PlayerNames))?;
        Some(PlayerEntry::decode_list(msg.first_payload().unwrap_or_default()))
    }

    pub fn server_new_game_info(&self) -> Option<NewGameInfo> {
        let msg = self
            .shared
            .engine
            .next_message(Category::Engine, Some(Subtype::NewGameInfo))?;
        Some(NewGameInfo::decode(msg.first_payload().unwrap_or_default()))
    }

    pub fn server_next_game(&self) -> bool {
        self.shared
            .engine
            .next_message(Category::Engine, Some(Subtype::NextGame))
            .is_some()
    }

    /// Whether the server acknowledged a message of `category` this client
    /// sent (normally a move).
    pub fn server_game_ok(&self, category: Category) -> bool {
        self.shared
            .engine
            .mailbox()
            .take_first(|e| e.message.acknowledged_category() == Some(category))
            .is_some()
    }

    // --- Blocking waits ---

    /// Block until a message of `category` (state or move) arrives, then
    /// acknowledge it with game-ok and return its payload.
    ///
    /// Gives up when the server aborts, the connection drops, the connection
    /// is closed, or `player` stops being active.
    ///
    /// The message is taken from the mailbox before the game-ok goes out. If
    /// that send fails the link is dead, the client is `Disconnected` and the
    /// payload is dropped along with the session.
    pub fn wait_for_server_game_information(
        &self,
        category: Category,
        player: Option<&dyn PlayerActivity>,
    ) -> Result<String, NetError> {
        let engine = &self.shared.engine;
        loop {
            if let Some(msg) = engine.next_message(category, None) {
                let payload = msg.first_payload().unwrap_or_default().to_string();
                self.send(&Message::game_ok(category))?;
                debug!(category = category.as_str(), "received game information");
                return Ok(payload);
            }
            if self.server_abort() {
                return Err(NetError::Aborted);
            }
            if engine.is_stopped() {
                return Err(NetError::Closed);
            }
            if self.state() != ConnectionState::Connected {
                return Err(NetError::NotConnected);
            }
            if player.is_some_and(|p| !p.is_active()) {
                return Err(NetError::PlayerInactive);
            }
            engine.pause();
        }
    }

    // --- Sending ---

    pub fn send_move(&self, payload: impl Into<String>) -> Result<(), NetError> {
        self.send(&Message::game_move(payload))
    }

    pub fn send_game_ok(&self, category: Category) -> Result<(), NetError> {
        self.send(&Message::game_ok(category))
    }

    /// Tell the server this client is not ready for the next game yet.
    pub fn send_next_game_pending(&self) -> Result<(), NetError> {
        self.send(&Message::next_game_pending())
    }

    /// Liveness probe; the server swallows it.
    pub fn send_test(&self) -> Result<(), NetError> {
        self.send(&Message::test())
    }

    /// Send any message while connected. A write failure disconnects.
    pub fn send(&self, message: &Message) -> Result<(), NetError> {
        let mut record = lock(&self.shared.record);
        if record.state != ConnectionState::Connected {
            return Err(NetError::NotConnected);
        }
        if let Err(e) = record.send(message) {
            warn!(error = %e, "send to server failed");
            record.disconnect();
            return Err(e.into());
        }
        Ok(())
    }

    /// Abort the session if connecting or connected, release the socket and
    /// reset to the initial empty state. Idempotent; a closed client cannot
    /// be restarted.
    pub fn close(&self) {
        {
            let mut record = lock(&self.shared.record);
            if record.state.is_live() && record.has_link() {
                let _ = record.send(&Message::abort());
                info!(name = %record.name, "closing connection to server");
            }
            record.reset();
        }
        self.shared.engine.close();
        let handle = lock(&self.handshake).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        self.shared.engine.mailbox().clear();
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientShared {
    fn handshake(&self, server: &str) -> Result<ClientId, NetError> {
        let stream = match server.parse::<SocketAddr>() {
            Ok(addr) => TcpStream::connect(addr)?,
            Err(_) => TcpStream::connect((server, self.config.port))?,
        };
        let link = LineLink::new(stream, self.config.read_timeout())?;
        let local = link
            .local_addr()
            .map(|a| a.ip().to_string())
            .unwrap_or_default();
        {
            let mut record = lock(&self.record);
            if record.state != ConnectionState::Connecting {
                return Err(NetError::Closed);
            }
            record.attach(link);
            let hello = Message::client_connect(&self.config.application_id, &record.name, &local);
            record.send(&hello)?;
            debug!(name = %record.name, "sent client-connect");
        }

        let id = self.await_accept()?;

        let mut record = lock(&self.record);
        if record.state != ConnectionState::Connecting {
            return Err(NetError::Closed);
        }
        record.id = Some(id);
        record.state = ConnectionState::Connected;
        record.send(&Message::client_acknowledge())?;
        info!(client_id = %id, name = %record.name, "connected to server");
        Ok(id)
    }

    fn await_accept(&self) -> Result<ClientId, NetError> {
        for _ in 0..self.config.handshake_poll_limit {
            if let Some(msg) = self
                .engine
                .next_message(Category::Control, Some(Subtype::ServerAccept))
            {
                return msg
                    .first_payload()
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| NetError::Protocol("server-accept without identity".into()));
            }
            if let Some(err) = self.handshake_error() {
                return Err(err);
            }
            if self.engine.is_stopped() || lock(&self.record).state != ConnectionState::Connecting {
                // The reader may have queued the reason just before the drop.
                return Err(self.handshake_error().unwrap_or(NetError::Closed));
            }
            self.engine.pause();
        }
        Err(NetError::HandshakeTimeout(Subtype::ServerAccept))
    }

    fn handshake_error(&self) -> Option<NetError> {
        HANDSHAKE_ERRORS
            .into_iter()
            .find(|s| self.engine.has_message(Category::Error, Some(*s)))
            .map(|s| match s {
                Subtype::Abort => NetError::Aborted,
                other => NetError::Rejected(other),
            })
    }
}

impl Endpoint for ClientShared {
    fn engine(&self) -> &ConnectionEngine {
        &self.engine
    }

    fn poll_inbound(&self) -> Vec<Envelope> {
        let mut record = lock(&self.record);
        if !record.state.is_live() {
            return Vec::new();
        }
        match record.read_line() {
            Ok(Some(line)) if !line.is_empty() => {
                vec![Envelope::from_server(Message::parse(&line))]
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "lost connection to server");
                record.disconnect();
                Vec::new()
            }
        }
    }

    fn handle_message(&self, envelope: &Envelope) -> bool {
        let msg = &envelope.message;
        if msg.matches(Category::Control, Some(Subtype::Test)) {
            trace!("probe from server");
            return false;
        }
        if msg.matches(Category::Error, Some(Subtype::Abort)) {
            info!("server aborted the session");
            lock(&self.record).disconnect();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;

    fn test_config() -> NetConfig {
        NetConfig {
            poll_interval_ms: 2,
            handshake_poll_limit: 50,
            ..NetConfig::default()
        }
    }

    /// A hand-driven fake server: accepts one socket and exposes raw lines.
    struct FakeServer {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl FakeServer {
        fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            Self {
                reader: BufReader::new(stream.try_clone().unwrap()),
                writer: stream,
            }
        }

        fn recv(&mut self) -> Message {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            Message::parse(line.trim_end_matches('\n'))
        }

        fn send(&mut self, msg: &Message) {
            writeln!(self.writer, "{}", msg.to_line()).unwrap();
        }
    }

    fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[test]
    fn handshake_reaches_connected() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();

        let mut server = FakeServer::accept(&listener);
        let hello = server.recv();
        assert!(hello.matches(Category::Control, Some(Subtype::ClientConnect)));
        assert_eq!(hello.payload()[0], "boardlink");
        assert_eq!(hello.payload()[1], "Alice");
        server.send(&Message::server_accept(ClientId(10)));

        assert_eq!(client.await_handshake().unwrap(), ClientId(10));
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.server_accepted(), Some(ClientId(10)));
        let ack = server.recv();
        assert!(ack.matches(Category::Control, Some(Subtype::ClientAcknowledge)));
    }

    #[test]
    fn silent_server_times_out_to_disconnected() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        let mut server = FakeServer::accept(&listener);
        let _hello = server.recv();

        let err = client.await_handshake().unwrap_err();
        assert!(matches!(err, NetError::HandshakeTimeout(Subtype::ServerAccept)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.server_accepted(), None);
    }

    #[test]
    fn name_exists_rejection_is_reported() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        let mut server = FakeServer::accept(&listener);
        let _hello = server.recv();
        server.send(&Message::name_exists("Alice"));

        let err = client.await_handshake().unwrap_err();
        assert!(matches!(err, NetError::Rejected(Subtype::NameExists)));
        assert_eq!(client.server_rejection(), Some(Subtype::NameExists));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn waits_for_state_and_acknowledges() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        let mut server = FakeServer::accept(&listener);
        let _hello = server.recv();
        server.send(&Message::server_accept(ClientId(10)));
        client.await_handshake().unwrap();
        let _ack = server.recv();

        server.send(&Message::player_names(&[PlayerEntry::new("Alice", "red")]));
        server.send(&Message::game_state("turn=1;board=x"));
        let payload = client
            .wait_for_server_game_information(Category::State, None)
            .unwrap();
        assert_eq!(payload, "turn=1;board=x");
        assert_eq!(server.recv(), Message::game_ok(Category::State));

        let names = client.server_player_names().unwrap();
        assert_eq!(names, vec![PlayerEntry::new("Alice", "red")]);
        assert_eq!(client.server_player_names(), None);
    }

    #[test]
    fn failed_acknowledgement_drops_payload() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        let mut server = FakeServer::accept(&listener);
        let _hello = server.recv();
        server.send(&Message::server_accept(ClientId(10)));
        client.await_handshake().unwrap();
        let _ack = server.recv();

        server.send(&Message::game_state("turn=1"));
        for _ in 0..1000 {
            if client.shared.engine.has_message(Category::State, None) {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(client.shared.engine.has_message(Category::State, None));
        // Drop the socket under the client so the game-ok cannot be written.
        lock(&client.shared.record).disconnect();
        lock(&client.shared.record).state = ConnectionState::Connected;

        let err = client
            .wait_for_server_game_information(Category::State, None)
            .unwrap_err();
        assert!(matches!(err, NetError::Io(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.shared.engine.has_message(Category::State, None));
    }

    #[test]
    fn inactive_player_ends_wait() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        let mut server = FakeServer::accept(&listener);
        let _hello = server.recv();
        server.send(&Message::server_accept(ClientId(10)));
        client.await_handshake().unwrap();

        let inactive = || false;
        let err = client
            .wait_for_server_game_information(Category::Move, Some(&inactive))
            .unwrap_err();
        assert!(matches!(err, NetError::PlayerInactive));
    }

    #[test]
    fn server_abort_ends_wait_and_disconnects() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        let mut server = FakeServer::accept(&listener);
        let _hello = server.recv();
        server.send(&Message::server_accept(ClientId(10)));
        client.await_handshake().unwrap();

        server.send(&Message::abort());
        let err = client
            .wait_for_server_game_information(Category::State, None)
            .unwrap_err();
        assert!(matches!(err, NetError::Aborted | NetError::NotConnected));
        assert!(client.server_abort());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn close_sends_abort_and_resets() {
        let (listener, addr) = listen();
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        let mut server = FakeServer::accept(&listener);
        let _hello = server.recv();
        server.send(&Message::server_accept(ClientId(10)));
        client.await_handshake().unwrap();
        let _ack = server.recv();

        client.close();
        assert_eq!(server.recv(), Message::abort());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.client_id(), None);
        assert!(client.display_name().is_empty());
        assert!(matches!(client.send_move("x"), Err(NetError::NotConnected)));
        assert!(matches!(
            client.start_client(&addr, "Alice"),
            Err(NetError::Closed)
        ));
    }

    #[test]
    fn connect_refused_ends_disconnected() {
        let (listener, addr) = listen();
        drop(listener);
        let client = ClientConnection::new(test_config());
        client.start_client(&addr, "Alice").unwrap();
        assert!(matches!(client.await_handshake(), Err(NetError::Io(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}

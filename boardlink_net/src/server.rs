// Server role: the client registry, slot accept threads, broadcast and the
// lock-step barrier.
//
// Architecture: one shared reader thread plus one accept thread per pending
// slot.
//
// - **Reader thread** (`ConnectionEngine` + `Endpoint::poll_inbound`):
//   round-robins over every `Connecting`/`Connected` record, reading at most
//   one line per record per pass, and queues each message into the single
//   server mailbox tagged with the sender's identity.
// - **Accept threads** (`start_connecting`): poll the non-blocking listener
//   until a socket arrives, then run the server half of the handshake for
//   that slot:
//     client-connect → check application id → claim display name →
//     server-accept [id] → client-acknowledge → `Connected`.
//   Any failure leaves the slot `Disconnected` and drops its queued messages.
// - **Caller thread**: the game engine. It broadcasts with `put_message_all`
//   (or the typed wrappers) and then blocks in `wait_for_clients_game_ok`
//   until every connected peer acknowledged, which is what keeps all clients
//   in lock-step.
//
// Identities are the smallest unused multiple of `identity_step` (10, 20,
// ...). Name uniqueness is checked and claimed under the registry lock, so
// two handshakes racing with one name cannot both succeed.
//
// Registry indices are positions in the ordered registry. `disconnect`
// removes the record, so indices after it shift down; identities never
// change while a record exists.

use std::io;
use std::net::{SocketAddr, TcpListener};
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

/// Snapshot of one registry entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientSummary {
    pub index: usize,
    pub id: Option<ClientId>,
    pub name: String,
    pub address: Option<SocketAddr>,
    pub slot: usize,
    pub state: ConnectionState,
}

/// A move received from a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMove {
    pub from: ClientId,
    pub payload: String,
}

struct ServerShared {
    config: NetConfig,
    engine: ConnectionEngine,
    listener: Mutex<Option<Arc<TcpListener>>>,
    registry: Mutex<Vec<ConnectionRecord>>,
    accept_threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Server side of a session. Dropping it closes every connection.
pub struct ServerConnection {
    shared: Arc<ServerShared>,
}

impl ServerConnection {
    pub fn new(config: NetConfig) -> Self {
        let engine = ConnectionEngine::new(config.poll_interval());
        Self {
            shared: Arc::new(ServerShared {
                config,
                engine,
                listener: Mutex::new(None),
                registry: Mutex::new(Vec::new()),
                accept_threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind the listening socket and start the reader thread. Returns the
    /// bound address (useful with port 0). Calling it again returns the same
    /// address.
    pub fn start_server(&self) -> Result<SocketAddr, NetError> {
        if self.shared.engine.is_stopped() {
            return Err(NetError::Closed);
        }
        let mut slot = lock(&self.shared.listener);
        if let Some(listener) = slot.as_ref() {
            return Ok(listener.local_addr()?);
        }
        let listener = TcpListener::bind(self.shared.config.listen_addr())?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        *slot = Some(Arc::new(listener));
        drop(slot);

        spawn_reader(&self.shared, "boardlink-server-reader")?;
        info!(%addr, application_id = %self.shared.config.application_id, "server listening");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.listener)
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }

    pub fn engine(&self) -> &ConnectionEngine {
        &self.shared.engine
    }

    // --- Slot lifecycle ---

    /// Append a `NotUsed` slot with a fresh identity without accepting on it.
    pub fn reserve_client(&self) -> ClientId {
        self.shared.append_record(ConnectionState::NotUsed)
    }

    /// Append a `Disconnected` slot with a fresh identity and start accepting
    /// a peer for it.
    pub fn add_client(&self) -> Result<ClientId, NetError> {
        if lock(&self.shared.listener).is_none() {
            return Err(NetError::NotStarted);
        }
        let id = self.shared.append_record(ConnectionState::Disconnected);
        self.start_connecting(id)?;
        Ok(id)
    }

    /// Move slot `id` to `Connecting` and spawn the thread that accepts a
    /// socket for it and runs the handshake. Works for fresh, reserved and
    /// previously failed slots.
    pub fn start_connecting(&self, id: ClientId) -> Result<(), NetError> {
        let listener = lock(&self.shared.listener)
            .clone()
            .ok_or(NetError::NotStarted)?;
        if self.shared.engine.is_stopped() {
            return Err(NetError::Closed);
        }
        {
            let mut registry = lock(&self.shared.registry);
            let record = find_mut(&mut registry, id).ok_or(NetError::UnknownIdentity(id))?;
            if record.state.is_live() {
                return Err(NetError::Protocol(format!("slot {id} is already active")));
            }
            record.disconnect();
            record.state = ConnectionState::Connecting;
        }
        self.shared.engine.mailbox().discard_from(id);

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("boardlink-accept-{id}"))
            .spawn(move || shared.serve_slot(id, &listener))?;
        let mut threads = lock(&self.shared.accept_threads);
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
        Ok(())
    }

    /// Abort the peer at `index` if reachable, close its socket, drop its
    /// queued messages and remove the record.
    pub fn disconnect(&self, index: usize) -> Result<(), NetError> {
        let record = {
            let mut registry = lock(&self.shared.registry);
            if index >= registry.len() {
                return Err(NetError::UnknownClient(index));
            }
            registry.remove(index)
        };
        self.shared.release(record);
        Ok(())
    }

    /// Shrink the registry by one, choosing the slot whose removal disturbs
    /// the session least. Returns the removed index.
    pub fn remove_best_fit_client(&self, preferred: Option<usize>) -> Option<usize> {
        let (index, record) = {
            let mut registry = lock(&self.shared.registry);
            let index = best_fit_index(&registry, preferred)?;
            (index, registry.remove(index))
        };
        self.shared.release(record);
        Some(index)
    }

    // --- Sending ---

    /// Send to the peer at `index`. A write failure disconnects it.
    pub fn put_message(&self, index: usize, message: &Message) -> Result<(), NetError> {
        let mut registry = lock(&self.shared.registry);
        let record = registry
            .get_mut(index)
            .ok_or(NetError::UnknownClient(index))?;
        if !record.state.is_live() {
            return Err(NetError::NotConnected);
        }
        send_or_disconnect(record, message)
    }

    /// Send to every connecting or connected peer except `except`. Succeeds
    /// only if every send did; peers whose send failed are disconnected.
    pub fn put_message_all(&self, message: &Message, except: Option<usize>) -> Result<(), NetError> {
        let mut registry = lock(&self.shared.registry);
        let mut attempted = 0;
        let mut failed = 0;
        for (index, record) in registry.iter_mut().enumerate() {
            if Some(index) == except || !record.state.is_live() || !record.has_link() {
                continue;
            }
            attempted += 1;
            if send_or_disconnect(record, message).is_err() {
                failed += 1;
            }
        }
        trace!(line = %message.to_line(), attempted, failed, "broadcast");
        if failed > 0 {
            return Err(NetError::BroadcastIncomplete { failed, attempted });
        }
        Ok(())
    }

    pub fn broadcast_state(&self, payload: impl Into<String>) -> Result<(), NetError> {
        self.put_message_all(&Message::game_state(payload), None)
    }

    /// Relay a move to everyone, usually except the client that made it.
    pub fn broadcast_move(
        &self,
        payload: impl Into<String>,
        except: Option<usize>,
    ) -> Result<(), NetError> {
        self.put_message_all(&Message::game_move(payload), except)
    }

    pub fn send_player_names(&self, players: &[PlayerEntry]) -> Result<(), NetError> {
        self.put_message_all(&Message::player_names(players), None)
    }

    pub fn send_new_game_info(&self, info: &NewGameInfo) -> Result<(), NetError> {
        self.put_message_all(&Message::new_game_info(info), None)
    }

    pub fn send_next_game(&self) -> Result<(), NetError> {
        self.put_message_all(&Message::next_game(), None)
    }

    /// Send control/test to every live peer. A peer whose socket is gone
    /// ends up `Disconnected`.
    pub fn probe_clients(&self) -> Result<(), NetError> {
        self.put_message_all(&Message::test(), None)
    }

    // --- Blocking waits ---

    /// The lock-step barrier: block until every peer that is `Connected` now
    /// (except the one at `except`) has acknowledged `category` with
    /// game-ok.
    ///
    /// Fails with `PeerDropped` as soon as a peer still owing its game-ok
    /// stops being `Connected`, or the connected count moves away from the
    /// number of peers waited on (a join counts too). An empty set succeeds
    /// immediately.
    pub fn wait_for_clients_game_ok(
        &self,
        category: Category,
        except: Option<usize>,
    ) -> Result<(), NetError> {
        let except_id = except.and_then(|i| self.client_id(i));
        let mut pending = self.shared.connected_ids(except_id);
        let expected = pending.len();
        if expected == 0 {
            return Ok(());
        }
        debug!(category = category.as_str(), expected, "waiting for game-ok");
        let engine = &self.shared.engine;
        loop {
            pending.retain(|id| {
                engine
                    .mailbox()
                    .take_first(|e| {
                        e.sender == Some(*id) && e.message.acknowledged_category() == Some(category)
                    })
                    .is_none()
            });
            if pending.is_empty() {
                return Ok(());
            }
            let connected = self.shared.connected_ids(except_id);
            if connected.len() != expected || pending.iter().any(|id| !connected.contains(id)) {
                warn!(
                    category = category.as_str(),
                    pending = ?pending,
                    expected,
                    connected = connected.len(),
                    "connected peers changed during barrier"
                );
                return Err(NetError::PeerDropped(category));
            }
            if engine.is_stopped() {
                return Err(NetError::Closed);
            }
            engine.pause();
        }
    }

    /// Block until any client sends a move, acknowledge it with
    /// game-ok(move) and return it.
    ///
    /// Gives up when `player` stops being active or the connected count
    /// changes.
    pub fn wait_for_client_move_information(
        &self,
        player: Option<&dyn PlayerActivity>,
    ) -> Result<ClientMove, NetError> {
        let engine = &self.shared.engine;
        let baseline = self.connected_count();
        loop {
            if let Some(Envelope {
                sender: Some(from),
                message,
            }) = engine.next_envelope(Category::Move, None)
            {
                let payload = message.first_payload().unwrap_or_default().to_string();
                if let Err(e) = self.shared.send_to(from, &Message::game_ok(Category::Move)) {
                    warn!(client_id = %from, error = %e, "could not acknowledge move");
                }
                debug!(client_id = %from, "received move");
                return Ok(ClientMove { from, payload });
            }
            if engine.is_stopped() {
                return Err(NetError::Closed);
            }
            if player.is_some_and(|p| !p.is_active()) {
                return Err(NetError::PlayerInactive);
            }
            if self.connected_count() != baseline {
                return Err(NetError::PeerDropped(Category::Move));
            }
            engine.pause();
        }
    }

    /// Consume an error/next-game-pending from the peer at `index`.
    pub fn next_game_pending_from(&self, index: usize) -> bool {
        self.client_id(index).is_some_and(|id| {
            self.shared
                .engine
                .next_message_from(Category::Error, Some(Subtype::NextGamePending), id)
                .is_some()
        })
    }

    // --- Registry queries ---

    pub fn client_count(&self) -> usize {
        lock(&self.shared.registry).len()
    }

    pub fn connected_count(&self) -> usize {
        self.shared.connected_ids(None).len()
    }

    pub fn client_state(&self, index: usize) -> Option<ConnectionState> {
        lock(&self.shared.registry).get(index).map(|r| r.state)
    }

    pub fn client_id(&self, index: usize) -> Option<ClientId> {
        lock(&self.shared.registry).get(index).and_then(|r| r.id)
    }

    pub fn client_name(&self, index: usize) -> Option<String> {
        lock(&self.shared.registry)
            .get(index)
            .map(|r| r.name.clone())
    }

    pub fn client_index(&self, id: ClientId) -> Option<usize> {
        lock(&self.shared.registry)
            .iter()
            .position(|r| r.id == Some(id))
    }

    /// Assign the player ordinal of the peer at `index`.
    pub fn set_slot(&self, index: usize, slot: usize) -> Result<(), NetError> {
        let mut registry = lock(&self.shared.registry);
        let record = registry
            .get_mut(index)
            .ok_or(NetError::UnknownClient(index))?;
        record.slot = slot;
        Ok(())
    }

    pub fn clients(&self) -> Vec<ClientSummary> {
        lock(&self.shared.registry)
            .iter()
            .enumerate()
            .map(|(index, r)| ClientSummary {
                index,
                id: r.id,
                name: r.name.clone(),
                address: r.address,
                slot: r.slot,
                state: r.state,
            })
            .collect()
    }

    /// Abort every live peer, empty the registry, stop the listener and wait
    /// for all background threads. Idempotent.
    pub fn close(&self) {
        self.shared.engine.close();
        let records: Vec<ConnectionRecord> = lock(&self.shared.registry).drain(..).collect();
        for mut record in records {
            if record.state.is_live() && record.has_link() {
                let _ = record.send(&Message::abort());
            }
            record.reset();
        }
        lock(&self.shared.listener).take();
        let threads: Vec<JoinHandle<()>> = lock(&self.shared.accept_threads).drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
        self.shared.engine.mailbox().clear();
        debug!("server closed");
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl ServerShared {
    fn append_record(&self, state: ConnectionState) -> ClientId {
        let mut registry = lock(&self.registry);
        let id = next_identity(&registry, self.config.identity_step);
        let slot = registry.len();
        registry.push(ConnectionRecord::new(Some(id), slot, state));
        debug!(client_id = %id, slot, %state, "slot added");
        id
    }

    /// Abort and close a record already taken out of the registry and drop
    /// its queued messages.
    fn release(&self, mut record: ConnectionRecord) {
        if record.state.is_live() && record.has_link() {
            let _ = record.send(&Message::abort());
        }
        record.disconnect();
        if let Some(id) = record.id {
            let dropped = self.engine.mailbox().discard_from(id);
            info!(client_id = %id, name = %record.name, dropped, "client removed");
        }
    }

    fn connected_ids(&self, except: Option<ClientId>) -> Vec<ClientId> {
        lock(&self.registry)
            .iter()
            .filter(|r| r.state == ConnectionState::Connected && r.id != except)
            .filter_map(|r| r.id)
            .collect()
    }

    fn is_connecting(&self, id: ClientId) -> bool {
        lock(&self.registry)
            .iter()
            .any(|r| r.id == Some(id) && r.state == ConnectionState::Connecting)
    }

    fn send_to(&self, id: ClientId, message: &Message) -> Result<(), NetError> {
        let mut registry = lock(&self.registry);
        let record = find_mut(&mut registry, id).ok_or(NetError::UnknownIdentity(id))?;
        send_or_disconnect(record, message)
    }

    /// Body of an accept thread.
    fn serve_slot(&self, id: ClientId, listener: &TcpListener) {
        let result = self
            .accept_peer(id, listener)
            .and_then(|link| self.handshake(id, link));
        match result {
            Ok(()) => {}
            Err(NetError::Closed) => {
                debug!(client_id = %id, "slot stopped accepting");
                self.abandon_slot(id);
            }
            Err(e) => {
                warn!(client_id = %id, error = %e, "client handshake failed");
                self.abandon_slot(id);
            }
        }
    }

    fn abandon_slot(&self, id: ClientId) {
        if let Some(record) = find_mut(&mut lock(&self.registry), id) {
            record.disconnect();
        }
        self.engine.mailbox().discard_from(id);
    }

    fn accept_peer(&self, id: ClientId, listener: &TcpListener) -> Result<LineLink, NetError> {
        loop {
            if self.engine.is_stopped() || !self.is_connecting(id) {
                return Err(NetError::Closed);
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(client_id = %id, %peer, "accepted socket");
                    return Ok(LineLink::new(stream, self.config.read_timeout())?);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handshake(&self, id: ClientId, link: LineLink) -> Result<(), NetError> {
        {
            let mut registry = lock(&self.registry);
            let record = find_mut(&mut registry, id).ok_or(NetError::Closed)?;
            if record.state != ConnectionState::Connecting {
                return Err(NetError::Closed);
            }
            record.attach(link);
        }

        let hello = self.await_from(id, Subtype::ClientConnect)?;
        let payload = hello.payload();
        let application_id = payload.first().map(String::as_str).unwrap_or_default();
        let name = payload.get(1).map(String::as_str).unwrap_or_default();

        {
            let mut registry = lock(&self.registry);
            if application_id != self.config.application_id {
                if let Some(record) = find_mut(&mut registry, id) {
                    let _ = record.send(&Message::wrong_application(&self.config.application_id));
                }
                return Err(NetError::Rejected(Subtype::WrongApplication));
            }
            if name.is_empty() {
                if let Some(record) = find_mut(&mut registry, id) {
                    let _ = record.send(&Message::abort());
                }
                return Err(NetError::Protocol("client-connect without a name".into()));
            }
            let taken = registry
                .iter()
                .any(|r| r.id != Some(id) && r.state.is_live() && r.name == name);
            let record = find_mut(&mut registry, id).ok_or(NetError::Closed)?;
            if taken {
                let _ = record.send(&Message::name_exists(name));
                return Err(NetError::Rejected(Subtype::NameExists));
            }
            record.name = name.to_string();
            record.send(&Message::server_accept(id))?;
        }

        self.await_from(id, Subtype::ClientAcknowledge)?;

        let mut registry = lock(&self.registry);
        let record = find_mut(&mut registry, id).ok_or(NetError::Closed)?;
        if record.state != ConnectionState::Connecting {
            return Err(NetError::Closed);
        }
        record.state = ConnectionState::Connected;
        info!(client_id = %id, name = %record.name, peer = ?record.address, "client connected");
        Ok(())
    }

    /// Poll for a control message of `subtype` from `id` during the
    /// handshake.
    fn await_from(&self, id: ClientId, subtype: Subtype) -> Result<Message, NetError> {
        for _ in 0..self.config.handshake_poll_limit {
            if let Some(msg) = self
                .engine
                .next_message_from(Category::Control, Some(subtype), id)
            {
                return Ok(msg);
            }
            if self
                .engine
                .next_message_from(Category::Error, Some(Subtype::Abort), id)
                .is_some()
            {
                return Err(NetError::Aborted);
            }
            if self.engine.is_stopped() || !self.is_connecting(id) {
                return Err(NetError::Closed);
            }
            self.engine.pause();
        }
        Err(NetError::HandshakeTimeout(subtype))
    }
}

impl Endpoint for ServerShared {
    fn engine(&self) -> &ConnectionEngine {
        &self.engine
    }

    fn poll_inbound(&self) -> Vec<Envelope> {
        let mut registry = lock(&self.registry);
        let mut inbound = Vec::new();
        for record in registry.iter_mut() {
            let Some(id) = record.id else { continue };
            if !record.state.is_live() || !record.has_link() {
                continue;
            }
            match record.read_line() {
                Ok(Some(line)) if !line.is_empty() => {
                    inbound.push(Envelope::from_client(id, Message::parse(&line)));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(client_id = %id, name = %record.name, error = %e, "lost client");
                    record.disconnect();
                }
            }
        }
        inbound
    }

    fn handle_message(&self, envelope: &Envelope) -> bool {
        let msg = &envelope.message;
        if msg.matches(Category::Control, Some(Subtype::Test)) {
            trace!(sender = ?envelope.sender, "probe from client");
            return false;
        }
        if msg.matches(Category::Error, Some(Subtype::Abort)) {
            if let Some(id) = envelope.sender {
                info!(client_id = %id, "client aborted");
                if let Some(record) = find_mut(&mut lock(&self.registry), id) {
                    record.disconnect();
                }
            }
        }
        true
    }
}

fn find_mut(registry: &mut [ConnectionRecord], id: ClientId) -> Option<&mut ConnectionRecord> {
    registry.iter_mut().find(|r| r.id == Some(id))
}

fn send_or_disconnect(record: &mut ConnectionRecord, message: &Message) -> Result<(), NetError> {
    if let Err(e) = record.send(message) {
        warn!(client_id = ?record.id, name = %record.name, error = %e, "send failed");
        record.disconnect();
        return Err(e.into());
    }
    Ok(())
}

/// Smallest multiple of `step` not held by any record.
fn next_identity(registry: &[ConnectionRecord], step: u32) -> ClientId {
    let step = step.max(1);
    let mut candidate = step;
    while registry.iter().any(|r| r.id == Some(ClientId(candidate))) {
        candidate += step;
    }
    ClientId(candidate)
}

/// Eviction order: never used, then disconnected, then connecting, then the
/// caller's preferred index, then connected. Within a tier the last record
/// goes first.
fn best_fit_index(registry: &[ConnectionRecord], preferred: Option<usize>) -> Option<usize> {
    let last_in = |state: ConnectionState| registry.iter().rposition(|r| r.state == state);
    last_in(ConnectionState::NotUsed)
        .or_else(|| last_in(ConnectionState::Disconnected))
        .or_else(|| last_in(ConnectionState::Connecting))
        .or_else(|| preferred.filter(|&i| i < registry.len()))
        .or_else(|| last_in(ConnectionState::Connected))
}

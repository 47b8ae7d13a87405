// End-to-end integration tests for the lock-step pipeline.
//
// Each test starts a real server, connects real clients (via `TestPlayer`),
// and drives the `TallyBoard` game through the same calls a game engine
// makes: player names, state broadcast + barrier, client move + relay +
// barrier. The only test-specific code is the bounded polling in the
// helpers.
//
// Acknowledgements queue up in the server mailbox, so a test can broadcast,
// let every player receive, and only then run the barrier on one thread.

use std::thread;
use std::time::Duration;

use boardlink_net::NetError;
use boardlink_protocol::{Category, ConnectionState, NewGameInfo, Subtype};
use multiplayer_tests::{TestHost, TestPlayer, wait_until};

/// Start a host with two slots and connect Alice and Bob.
fn two_player_session() -> (TestHost, TestPlayer, TestPlayer) {
    let mut host = TestHost::start(2);
    let mut alice = TestPlayer::join(host.addr, "Alice");
    let mut bob = TestPlayer::join(host.addr, "Bob");
    host.await_players(2);
    host.announce_players();
    alice.await_player_names();
    bob.await_player_names();
    (host, alice, bob)
}

// ---------------------------------------------------------------------------
// Test scenarios
// ---------------------------------------------------------------------------

/// Both players see the same names and the same initial board.
#[test]
fn two_player_lifecycle() {
    let (mut host, mut alice, mut bob) = two_player_session();
    assert_eq!(alice.players, bob.players);
    let names: Vec<&str> = alice.players.iter().map(|p| p.name.as_str()).collect();
    assert!(names.contains(&"Alice") && names.contains(&"Bob"));
    assert_ne!(alice.players[0].color, alice.players[1].color);

    host.broadcast_board().unwrap();
    assert_eq!(alice.receive_state().unwrap(), &host.board);
    assert_eq!(bob.receive_state().unwrap(), &host.board);
    host.await_acks(Category::State, None).unwrap();
    assert_eq!(host.board.round, 1);
}

/// A move from one client is acknowledged, relayed to the other and folded
/// into the next state; every replica ends identical.
#[test]
fn move_round_trip_keeps_replicas_in_lockstep() {
    let (mut host, mut alice, mut bob) = two_player_session();
    host.broadcast_board().unwrap();
    alice.receive_state().unwrap();
    bob.receive_state().unwrap();
    host.await_acks(Category::State, None).unwrap();

    alice.play(5).unwrap();
    let (absorbed, except) = host.absorb_move().unwrap();
    alice.await_move_ack();
    assert_eq!(except, host.server.client_index(alice.id().unwrap()));
    let relayed = bob.receive_move().unwrap();
    host.await_acks(Category::Move, except).unwrap();
    assert_eq!(absorbed, relayed);
    assert_eq!(absorbed.player, "Alice");
    assert_eq!(bob.board.as_ref().unwrap().totals["Alice"], 5);

    host.broadcast_board().unwrap();
    let alice_board = alice.receive_state().unwrap().clone();
    let bob_board = bob.receive_state().unwrap().clone();
    host.await_acks(Category::State, None).unwrap();
    assert_eq!(alice_board, host.board);
    assert_eq!(bob_board, host.board);
    assert_eq!(host.board.round, 2);
    assert_eq!(host.board.totals["Alice"], 5);
    assert_eq!(host.board.totals["Bob"], 0);
    assert_eq!(host.board.history.len(), 1);
}

/// A player leaving during a barrier fails it; after evicting the departed
/// slots the remaining player continues.
#[test]
fn dropout_fails_barrier_then_session_continues() {
    let mut host = TestHost::start(3);
    let mut alice = TestPlayer::join(host.addr, "Alice");
    let bob = TestPlayer::join(host.addr, "Bob");
    let carol = TestPlayer::join(host.addr, "Carol");
    host.await_players(3);
    host.announce_players();

    let carol_index = host.server.client_index(carol.id().unwrap()).unwrap();
    carol.leave();
    wait_until("carol disconnected", || {
        host.server.client_state(carol_index) == Some(ConnectionState::Disconnected)
    });

    // Carol is gone before the broadcast, so the barrier waits on Alice and
    // Bob only. Bob leaving mid-barrier without acknowledging fails it.
    host.broadcast_board().unwrap();
    alice.receive_state().unwrap();
    let leaver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        bob.leave();
    });
    let err = host.await_acks(Category::State, None).unwrap_err();
    leaver.join().unwrap();
    assert!(matches!(err, NetError::PeerDropped(Category::State)));

    assert!(host.server.remove_best_fit_client(None).is_some());
    assert!(host.server.remove_best_fit_client(None).is_some());
    assert_eq!(host.server.client_count(), 1);
    assert_eq!(host.server.client_id(0), alice.id());

    host.broadcast_board().unwrap();
    assert_eq!(alice.receive_state().unwrap().round, 2);
    host.await_acks(Category::State, None).unwrap();
}

/// A slot freed by a departed player can be re-armed for a new one, who
/// inherits the identity.
#[test]
fn departed_slot_is_rearmed_for_newcomer() {
    let (host, alice, bob) = two_player_session();
    let bob_id = bob.id().unwrap();
    let index = host.server.client_index(bob_id).unwrap();
    bob.leave();
    wait_until("bob disconnected", || {
        host.server.client_state(index) == Some(ConnectionState::Disconnected)
    });

    host.server.start_connecting(bob_id).unwrap();
    let carol = TestPlayer::join(host.addr, "Carol");
    assert_eq!(carol.id(), Some(bob_id));
    host.await_players(2);
    assert_eq!(host.server.client_name(index).as_deref(), Some("Carol"));
    assert!(alice.client.server_accepted().is_some());
}

/// A name already in use is refused while its owner is connected.
#[test]
fn taken_name_is_refused() {
    let (host, _alice, _bob) = two_player_session();
    let spare = host.server.add_client().unwrap();
    let err = TestPlayer::try_join(host.addr, "Alice").err().unwrap();
    assert!(matches!(err, NetError::Rejected(Subtype::NameExists)));
    let index = host.server.client_index(spare).unwrap();
    wait_until("spare slot released", || {
        host.server.client_state(index) == Some(ConnectionState::Disconnected)
    });
    assert_eq!(host.server.connected_count(), 2);
}

/// Between games the host announces settings; a player that is not ready
/// says so.
#[test]
fn next_game_negotiation() {
    let (host, alice, bob) = two_player_session();
    let mut info = NewGameInfo::new();
    info.set("target", "21").set("seed", "42");
    host.server.send_new_game_info(&info).unwrap();

    for player in [&alice, &bob] {
        let mut received = None;
        wait_until("new game info", || {
            received = player.client.server_new_game_info();
            received.is_some()
        });
        assert_eq!(received.unwrap(), info);
    }

    bob.client.send_next_game_pending().unwrap();
    let bob_index = host.server.client_index(bob.id().unwrap()).unwrap();
    let alice_index = host.server.client_index(alice.id().unwrap()).unwrap();
    wait_until("pending notice", || host.server.next_game_pending_from(bob_index));
    assert!(!host.server.next_game_pending_from(alice_index));

    host.server.send_next_game().unwrap();
    wait_until("alice next game", || alice.client.server_next_game());
    wait_until("bob next game", || bob.client.server_next_game());
}

// Protocol vocabulary and the parsed message type.
//
// Two closed enums define every category and subtype the protocol uses:
//
// | Category | Subtypes                                                   |
// |----------|------------------------------------------------------------|
// | control  | client-connect, server-accept, client-acknowledge, test    |
// | error    | abort, name-exists, wrong-application, next-game-pending   |
// | engine   | new-game-info, player-names, next-game, game-ok            |
// | state    | (payload only)                                             |
// | move     | (payload only)                                             |
//
// `Message` keeps the raw field list, so a line with an unknown category or
// subtype still parses; it simply never matches any consumer. `Envelope`
// adds the sender identity the server tags inbound messages with, instead of
// appending it as an extra field.

use crate::codec;
use crate::payload::{NewGameInfo, PlayerEntry};
use crate::types::ClientId;

/// Top-level message category (field 0).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Control,
    Error,
    Engine,
    State,
    Move,
}

impl Category {
    pub const fn as_str(self) -> &'static str {
        match self {
            Category::Control => "control",
            Category::Error => "error",
            Category::Engine => "engine",
            Category::State => "state",
            Category::Move => "move",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "control" => Some(Category::Control),
            "error" => Some(Category::Error),
            "engine" => Some(Category::Engine),
            "state" => Some(Category::State),
            "move" => Some(Category::Move),
            _ => None,
        }
    }

    /// Whether field 1 of this category is a subtype rather than payload.
    pub const fn has_subtype(self) -> bool {
        matches!(self, Category::Control | Category::Error | Category::Engine)
    }
}

/// Message subtype (field 1) for the control, error and engine categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Subtype {
    ClientConnect,
    ServerAccept,
    ClientAcknowledge,
    Test,
    Abort,
    NameExists,
    WrongApplication,
    NextGamePending,
    NewGameInfo,
    PlayerNames,
    NextGame,
    GameOk,
}

impl Subtype {
    pub const fn as_str(self) -> &'static str {
        match self {
            Subtype::ClientConnect => "client-connect",
            Subtype::ServerAccept => "server-accept",
            Subtype::ClientAcknowledge => "client-acknowledge",
            Subtype::Test => "test",
            Subtype::Abort => "abort",
            Subtype::NameExists => "name-exists",
            Subtype::WrongApplication => "wrong-application",
            Subtype::NextGamePending => "next-game-pending",
            Subtype::NewGameInfo => "new-game-info",
            Subtype::PlayerNames => "player-names",
            Subtype::NextGame => "next-game",
            Subtype::GameOk => "game-ok",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        let subtype = match s {
            "client-connect" => Subtype::ClientConnect,
            "server-accept" => Subtype::ServerAccept,
            "client-acknowledge" => Subtype::ClientAcknowledge,
            "test" => Subtype::Test,
            "abort" => Subtype::Abort,
            "name-exists" => Subtype::NameExists,
            "wrong-application" => Subtype::WrongApplication,
            "next-game-pending" => Subtype::NextGamePending,
            "new-game-info" => Subtype::NewGameInfo,
            "player-names" => Subtype::PlayerNames,
            "next-game" => Subtype::NextGame,
            "game-ok" => Subtype::GameOk,
            _ => return None,
        };
        Some(subtype)
    }

    /// The category this subtype belongs to.
    pub const fn category(self) -> Category {
        match self {
            Subtype::ClientConnect
            | Subtype::ServerAccept
            | Subtype::ClientAcknowledge
            | Subtype::Test => Category::Control,
            Subtype::Abort
            | Subtype::NameExists
            | Subtype::WrongApplication
            | Subtype::NextGamePending => Category::Error,
            Subtype::NewGameInfo | Subtype::PlayerNames | Subtype::NextGame | Subtype::GameOk => {
                Category::Engine
            }
        }
    }
}

/// One protocol message: an ordered list of unescaped fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    fields: Vec<String>,
}

impl Message {
    /// Build a message from its header and payload fields.
    pub fn new<I, S>(category: Category, subtype: Option<Subtype>, payload: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = vec![category.as_str().to_string()];
        if let Some(subtype) = subtype {
            fields.push(subtype.as_str().to_string());
        }
        fields.extend(payload.into_iter().map(Into::into));
        Self { fields }
    }

    /// Parse one wire line. Never fails: unknown vocabulary is kept verbatim.
    pub fn parse(line: &str) -> Self {
        Self {
            fields: codec::split(line),
        }
    }

    /// Encode as one wire line, without the trailing newline.
    pub fn to_line(&self) -> String {
        codec::encode(&self.fields)
    }

    pub fn category(&self) -> Option<Category> {
        self.fields.first().and_then(|f| Category::from_wire(f))
    }

    /// Subtype, for categories that carry one.
    pub fn subtype(&self) -> Option<Subtype> {
        if !self.category()?.has_subtype() {
            return None;
        }
        self.fields.get(1).and_then(|f| Subtype::from_wire(f))
    }

    /// True when the category matches and, if `subtype` is given, the
    /// subtype matches too.
    pub fn matches(&self, category: Category, subtype: Option<Subtype>) -> bool {
        self.category() == Some(category) && subtype.is_none_or(|s| self.subtype() == Some(s))
    }

    /// Raw field at `index`, header included.
    pub fn part(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn part_count(&self) -> usize {
        self.fields.len()
    }

    /// Payload fields, i.e. everything after the category and subtype.
    pub fn payload(&self) -> &[String] {
        let header = match self.category() {
            Some(c) if c.has_subtype() => 2,
            _ => 1,
        };
        self.fields.get(header..).unwrap_or(&[])
    }

    /// First payload field, if any.
    pub fn first_payload(&self) -> Option<&str> {
        self.payload().first().map(String::as_str)
    }

    // --- Handshake ---

    pub fn client_connect(application_id: &str, display_name: &str, local_address: &str) -> Self {
        Self::new(
            Category::Control,
            Some(Subtype::ClientConnect),
            [application_id, display_name, local_address],
        )
    }

    pub fn server_accept(id: ClientId) -> Self {
        Self::new(Category::Control, Some(Subtype::ServerAccept), [id.to_string()])
    }

    pub fn client_acknowledge() -> Self {
        Self::new(Category::Control, Some(Subtype::ClientAcknowledge), Vec::<String>::new())
    }

    pub fn test() -> Self {
        Self::new(Category::Control, Some(Subtype::Test), Vec::<String>::new())
    }

    // --- Errors ---

    pub fn abort() -> Self {
        Self::new(Category::Error, Some(Subtype::Abort), Vec::<String>::new())
    }

    pub fn name_exists(name: &str) -> Self {
        Self::new(Category::Error, Some(Subtype::NameExists), [name])
    }

    pub fn wrong_application(expected: &str) -> Self {
        Self::new(Category::Error, Some(Subtype::WrongApplication), [expected])
    }

    pub fn next_game_pending() -> Self {
        Self::new(Category::Error, Some(Subtype::NextGamePending), Vec::<String>::new())
    }

    // --- Engine ---

    pub fn new_game_info(info: &NewGameInfo) -> Self {
        Self::new(Category::Engine, Some(Subtype::NewGameInfo), [info.encode()])
    }

    pub fn player_names(players: &[PlayerEntry]) -> Self {
        Self::new(
            Category::Engine,
            Some(Subtype::PlayerNames),
            [PlayerEntry::encode_list(players)],
        )
    }

    pub fn next_game() -> Self {
        Self::new(Category::Engine, Some(Subtype::NextGame), Vec::<String>::new())
    }

    /// Acknowledge receipt of a message of `category` (state or move).
    pub fn game_ok(category: Category) -> Self {
        Self::new(Category::Engine, Some(Subtype::GameOk), [category.as_str()])
    }

    // --- Game payloads ---

    pub fn game_state(payload: impl Into<String>) -> Self {
        Self::new(Category::State, None, [payload.into()])
    }

    pub fn game_move(payload: impl Into<String>) -> Self {
        Self::new(Category::Move, None, [payload.into()])
    }

    /// For a game-ok message, the category it acknowledges.
    pub fn acknowledged_category(&self) -> Option<Category> {
        if !self.matches(Category::Engine, Some(Subtype::GameOk)) {
            return None;
        }
        self.first_payload().and_then(Category::from_wire)
    }
}

/// A received message together with its origin. `sender` is set by the
/// server for every message read from a client and is `None` on the client,
/// whose only peer is the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Option<ClientId>,
    pub message: Message,
}

impl Envelope {
    pub fn from_server(message: Message) -> Self {
        Self {
            sender: None,
            message,
        }
    }

    pub fn from_client(sender: ClientId, message: Message) -> Self {
        Self {
            sender: Some(sender),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_round_trips_through_wire_names() {
        let categories = [
            Category::Control,
            Category::Error,
            Category::Engine,
            Category::State,
            Category::Move,
        ];
        for c in categories {
            assert_eq!(Category::from_wire(c.as_str()), Some(c));
        }
        let subtypes = [
            Subtype::ClientConnect,
            Subtype::ServerAccept,
            Subtype::ClientAcknowledge,
            Subtype::Test,
            Subtype::Abort,
            Subtype::NameExists,
            Subtype::WrongApplication,
            Subtype::NextGamePending,
            Subtype::NewGameInfo,
            Subtype::PlayerNames,
            Subtype::NextGame,
            Subtype::GameOk,
        ];
        for s in subtypes {
            assert_eq!(Subtype::from_wire(s.as_str()), Some(s));
            assert!(s.category().has_subtype());
        }
    }

    #[test]
    fn client_connect_layout() {
        let msg = Message::client_connect("boardlink", "Alice", "10.0.0.2");
        assert_eq!(msg.to_line(), "control;client-connect;boardlink;Alice;10.0.0.2");
        assert_eq!(msg.category(), Some(Category::Control));
        assert_eq!(msg.subtype(), Some(Subtype::ClientConnect));
        assert_eq!(msg.payload(), ["boardlink", "Alice", "10.0.0.2"]);
    }

    #[test]
    fn state_has_no_subtype() {
        let msg = Message::game_state("board;with;semicolons");
        assert_eq!(msg.category(), Some(Category::State));
        assert_eq!(msg.subtype(), None);
        assert_eq!(msg.first_payload(), Some("board;with;semicolons"));
        assert!(msg.matches(Category::State, None));
        assert!(!msg.matches(Category::State, Some(Subtype::GameOk)));

        let parsed = Message::parse(&msg.to_line());
        assert_eq!(parsed, msg);
    }

    #[test]
    fn unknown_vocabulary_parses_but_never_matches() {
        let msg = Message::parse("telemetry;fps;60");
        assert_eq!(msg.category(), None);
        assert_eq!(msg.subtype(), None);
        assert_eq!(msg.part_count(), 3);
        assert!(!msg.matches(Category::Control, None));

        let msg = Message::parse("control;dance");
        assert_eq!(msg.category(), Some(Category::Control));
        assert_eq!(msg.subtype(), None);
        assert!(msg.matches(Category::Control, None));
        assert!(!msg.matches(Category::Control, Some(Subtype::Test)));
    }

    #[test]
    fn game_ok_names_its_category() {
        let msg = Message::game_ok(Category::Move);
        assert_eq!(msg.acknowledged_category(), Some(Category::Move));
        assert_eq!(Message::abort().acknowledged_category(), None);
    }

    #[test]
    fn empty_payload_slices() {
        assert!(Message::abort().payload().is_empty());
        assert!(Message::parse("").payload().is_empty());
        assert_eq!(Message::parse("").part(0), Some(""));
    }
}

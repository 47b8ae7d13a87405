// Structured payloads carried inside a single message field.
//
// - `PlayerEntry` lists travel in engine/player-names as one list field whose
//   entries are `name=color` pairs.
// - `NewGameInfo` travels in engine/new-game-info as one list field of
//   `key=value` pairs; order is preserved.
// - `GameCodec` is the seam to the game engine: it turns the engine's state
//   and move types into the single string carried by state and move
//   messages. The network layer never looks inside. `JsonGameCodec` covers
//   any serde type.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec;

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("malformed {what} payload: {detail}")]
    Malformed { what: &'static str, detail: String },
    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// One player as announced by the server: display name and piece color.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub name: String,
    pub color: String,
}

impl PlayerEntry {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
        }
    }

    /// Encode a player list into one payload field.
    pub fn encode_list(players: &[PlayerEntry]) -> String {
        codec::encode_pairs(players.iter().map(|p| (p.name.as_str(), p.color.as_str())))
    }

    pub fn decode_list(field: &str) -> Vec<PlayerEntry> {
        codec::decode_pairs(field)
            .into_iter()
            .map(|(name, color)| PlayerEntry { name, color })
            .collect()
    }
}

/// Ordered key/value settings for a new game (board size, rule variant, ...).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGameInfo {
    entries: Vec<(String, String)>,
}

impl NewGameInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an existing value in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Parse `key` with `FromStr`.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, PayloadError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| PayloadError::Malformed {
                what: "new-game-info",
                detail: format!("{key}={raw}"),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> String {
        codec::encode_pairs(self.iter())
    }

    pub fn decode(field: &str) -> Self {
        let mut info = Self::new();
        for (k, v) in codec::decode_pairs(field) {
            info.set(k, v);
        }
        info
    }
}

/// Converts the game engine's state and move types to and from the single
/// string carried by state and move messages.
pub trait GameCodec {
    type State;
    type Move;

    fn encode_state(&self, state: &Self::State) -> Result<String, PayloadError>;
    fn decode_state(&self, payload: &str) -> Result<Self::State, PayloadError>;
    fn encode_move(&self, mv: &Self::Move) -> Result<String, PayloadError>;
    fn decode_move(&self, payload: &str) -> Result<Self::Move, PayloadError>;
}

/// `GameCodec` for any serde state and move types, via JSON.
pub struct JsonGameCodec<S, M> {
    _types: PhantomData<fn() -> (S, M)>,
}

impl<S, M> JsonGameCodec<S, M> {
    pub fn new() -> Self {
        Self {
            _types: PhantomData,
        }
    }
}

impl<S, M> Default for JsonGameCodec<S, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, M> GameCodec for JsonGameCodec<S, M>
where
    S: Serialize + DeserializeOwned,
    M: Serialize + DeserializeOwned,
{
    type State = S;
    type Move = M;

    fn encode_state(&self, state: &S) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(state)?)
    }

    fn decode_state(&self, payload: &str) -> Result<S, PayloadError> {
        Ok(serde_json::from_str(payload)?)
    }

    fn encode_move(&self, mv: &M) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(mv)?)
    }

    fn decode_move(&self, payload: &str) -> Result<M, PayloadError> {
        Ok(serde_json::from_str(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Category, Message, Subtype};

    #[test]
    fn player_list_through_message() {
        let players = vec![
            PlayerEntry::new("Alice", "white"),
            PlayerEntry::new("Bob=the;builder", "black"),
        ];
        let msg = Message::player_names(&players);
        let parsed = Message::parse(&msg.to_line());
        assert!(parsed.matches(Category::Engine, Some(Subtype::PlayerNames)));
        assert_eq!(PlayerEntry::decode_list(parsed.first_payload().unwrap()), players);
    }

    #[test]
    fn new_game_info_keeps_order_and_replaces() {
        let mut info = NewGameInfo::new();
        info.set("rows", "8").set("cols", "8").set("variant", "classic");
        info.set("rows", "10");
        let keys: Vec<&str> = info.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["rows", "cols", "variant"]);

        let decoded = NewGameInfo::decode(&info.encode());
        assert_eq!(decoded, info);
        assert_eq!(decoded.get_parsed::<u32>("rows").unwrap(), Some(10));
        assert_eq!(decoded.get_parsed::<u32>("missing").unwrap(), None);
        assert!(decoded.get_parsed::<u32>("variant").is_err());
    }

    #[test]
    fn empty_new_game_info() {
        let info = NewGameInfo::decode("");
        assert!(info.is_empty());
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Board {
        cells: Vec<u8>,
        to_move: String,
    }

    #[test]
    fn json_codec_handles_state_and_move() {
        let codec: JsonGameCodec<Board, (u8, u8)> = JsonGameCodec::new();
        let board = Board {
            cells: vec![0, 1, 2],
            to_move: "white;black".into(),
        };
        let payload = codec.encode_state(&board).unwrap();
        let msg = Message::parse(&Message::game_state(payload).to_line());
        let back = codec.decode_state(msg.first_payload().unwrap()).unwrap();
        assert_eq!(back, board);

        let mv = codec.encode_move(&(3, 4)).unwrap();
        assert_eq!(codec.decode_move(&mv).unwrap(), (3, 4));
        assert!(matches!(codec.decode_move("nope"), Err(PayloadError::Json(_))));
    }
}

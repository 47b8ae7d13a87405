// boardlink_protocol: wire vocabulary for lock-step multiplayer sessions.
//
// This crate defines the text message format spoken between the server and
// client roles in `boardlink_net`. It is pure: no sockets, no threads.
//
// Module overview:
// - `codec.rs`:    Delimiter-separated field encoding with escaping, plus the
//                  list and pair sub-encodings used inside payload fields.
// - `message.rs`:  `Category`/`Subtype` vocabulary, the parsed `Message`, the
//                  sender-tagged `Envelope`, typed message constructors.
// - `payload.rs`:  `PlayerEntry`, `NewGameInfo`, and the `GameCodec` seam to
//                  the game engine (with a serde_json implementation).
// - `types.rs`:    `ClientId` and `ConnectionState`.
//
// Design decisions:
// - **One message per line.** The codec escapes line breaks, so any payload
//   fits a line-oriented stream.
// - **Escape instead of reject.** Player names and payloads may contain the
//   separators; they are escaped on encode and restored on decode.
// - **Game payloads are opaque strings.** The game engine serializes its own
//   state and moves through a `GameCodec`; this crate never inspects them.

pub mod codec;
pub mod message;
pub mod payload;
pub mod types;

pub use codec::{decode_part, encode, encode_message, part_count};
pub use message::{Category, Envelope, Message, Subtype};
pub use payload::{GameCodec, JsonGameCodec, NewGameInfo, PayloadError, PlayerEntry};
pub use types::{ClientId, ConnectionState};

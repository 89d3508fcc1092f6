//! Request/reply wire protocol between brokers and clients
//!
//! Each frame is a 4-byte big-endian length followed by one JSON document.
//! A connection carries strictly alternating frames: one [`Request`] from
//! the client, then one [`Response`] from the broker.

pub mod codec;
pub mod frames;

pub use codec::{ClientCodec, JsonCodec, ServerCodec};
pub use frames::{ErrorKind, ErrorReply, Request, Response};

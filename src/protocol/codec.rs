//! Length-prefixed JSON codec for [`Framed`](tokio_util::codec::Framed) streams

use crate::protocol::{Request, Response};
use crate::{BrokerError, Result};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Codec used by the broker: reads requests, writes responses
pub type ServerCodec = JsonCodec<Response, Request>;

/// Codec used by clients: writes requests, reads responses
pub type ClientCodec = JsonCodec<Request, Response>;

/// Encodes `E` and decodes `D` as JSON documents inside length-delimited frames
pub struct JsonCodec<E, D> {
    frames: LengthDelimitedCodec,
    _types: PhantomData<fn(E) -> D>,
}

impl<E, D> JsonCodec<E, D> {
    /// Create a codec rejecting frames longer than `max_frame_length` bytes
    pub fn new(max_frame_length: usize) -> Self {
        let frames = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(max_frame_length)
            .new_codec();
        Self {
            frames,
            _types: PhantomData,
        }
    }
}

impl<E, D: DeserializeOwned> Decoder for JsonCodec<E, D> {
    type Item = D;
    type Error = BrokerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>> {
        let frame = match self.frames.decode(src) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(e) => return Err(framing_error(e)),
        };

        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| BrokerError::Protocol(format!("undecodable frame: {}", e)))
    }
}

impl<E: Serialize, D> Encoder<E> for JsonCodec<E, D> {
    type Error = BrokerError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<()> {
        let body = serde_json::to_vec(&item)?;
        self.frames
            .encode(Bytes::from(body), dst)
            .map_err(framing_error)
    }
}

fn framing_error(err: io::Error) -> BrokerError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
            BrokerError::Protocol(err.to_string())
        }
        _ => BrokerError::Io(err),
    }
}

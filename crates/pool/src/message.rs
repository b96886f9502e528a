//! The wire tagged union (spec §4.6, §6): control tags `0x01..=0x05` are
//! reserved, `0x06` and above are caller-registered application messages.
use std::any::Any;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::registry::peer::PeerId;
use crate::registry::point::PointId;

pub const TAG_DISCONNECT: u8 = 0x01;
pub const TAG_BOOTSTRAP: u8 = 0x02;
pub const TAG_ADVERTISE: u8 = 0x03;
pub const TAG_SWAP_REQUEST: u8 = 0x04;
pub const TAG_SWAP_ACK: u8 = 0x05;
pub const FIRST_USER_TAG: u8 = 0x06;

/// A decoded frame, before it is routed to either the control-message
/// worker (spec §4.6) or the app-queue.
#[derive(Debug)]
pub enum Frame {
    Disconnect,
    Bootstrap,
    Advertise(Vec<PointId>),
    SwapRequest { point: PointId, peer: PeerId },
    SwapAck { point: PointId, peer: PeerId },
    Message { tag: u8, payload: Vec<u8> },
}

impl Frame {
    /// Parse a raw frame `{tag, body}` into a [`Frame`]. Control frames
    /// are decoded eagerly (their shape is fixed); user-message frames
    /// are left as raw bytes for the caller's codec to decode later.
    pub fn decode(tag: u8, body: &[u8]) -> Result<Self, Error> {
        match tag {
            TAG_DISCONNECT => Ok(Frame::Disconnect),
            TAG_BOOTSTRAP => Ok(Frame::Bootstrap),
            TAG_ADVERTISE => {
                let points: Vec<PointId> = serde_json::from_slice(body)
                    .map_err(|e| Error::DecodingError(format!("advertise: {e}")))?;
                Ok(Frame::Advertise(points))
            }
            TAG_SWAP_REQUEST => {
                let (point, peer): (PointId, PeerId) = serde_json::from_slice(body)
                    .map_err(|e| Error::DecodingError(format!("swap_request: {e}")))?;
                Ok(Frame::SwapRequest { point, peer })
            }
            TAG_SWAP_ACK => {
                let (point, peer): (PointId, PeerId) = serde_json::from_slice(body)
                    .map_err(|e| Error::DecodingError(format!("swap_ack: {e}")))?;
                Ok(Frame::SwapAck { point, peer })
            }
            tag if tag >= FIRST_USER_TAG => Ok(Frame::Message {
                tag,
                payload: body.to_vec(),
            }),
            tag => Err(Error::DecodingError(format!("unknown control tag {tag:#x}"))),
        }
    }

    pub fn encode(&self) -> Result<(u8, Vec<u8>), Error> {
        Ok(match self {
            Frame::Disconnect => (TAG_DISCONNECT, Vec::new()),
            Frame::Bootstrap => (TAG_BOOTSTRAP, Vec::new()),
            Frame::Advertise(points) => (
                TAG_ADVERTISE,
                serde_json::to_vec(points).map_err(Error::Json)?,
            ),
            Frame::SwapRequest { point, peer } => (
                TAG_SWAP_REQUEST,
                serde_json::to_vec(&(point, peer)).map_err(Error::Json)?,
            ),
            Frame::SwapAck { point, peer } => (
                TAG_SWAP_ACK,
                serde_json::to_vec(&(point, peer)).map_err(Error::Json)?,
            ),
            Frame::Message { tag, payload } => (*tag, payload.clone()),
        })
    }
}

/// Encode a control [`Frame`] (anything but `Message`) to wire bytes
/// (`tag` followed by its body), for use with [`crate::connection::Connection::raw_write_sync`].
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, Error> {
    let (tag, body) = frame.encode()?;
    let mut bytes = Vec::with_capacity(1 + body.len());
    bytes.push(tag);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// An application message delivered through the app-queue: a registered
/// tag plus a decoded, type-erased payload the caller downcasts back
/// (spec §9: "existentially-quantified encoding entries").
pub struct AppMessage {
    pub tag: u8,
    pub value: Box<dyn Any + Send>,
}

impl AppMessage {
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        match self.value.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            Err(value) => Err(AppMessage {
                tag: self.tag,
                value,
            }),
        }
    }
}

/// One entry of the existentially-quantified encoding registry: `{tag,
/// codec, max_length}`.
pub trait MessageCodec: Send + Sync {
    fn tag(&self) -> u8;
    fn max_length(&self) -> Option<usize>;
    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, Error>;
    fn encode(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, Error>;
}

/// Convenience [`MessageCodec`] for any `serde`-compatible type, JSON
/// encoded (mirrors `meta_config.encoding` used for persistence).
pub struct JsonCodec<T> {
    tag: u8,
    max_length: Option<usize>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> JsonCodec<T> {
    pub fn new(tag: u8, max_length: Option<usize>) -> Self {
        assert!(tag >= FIRST_USER_TAG, "tags below 0x06 are reserved");
        Self {
            tag,
            max_length,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn tag(&self) -> u8 {
        self.tag
    }

    fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn Any + Send>, Error> {
        let value: T = serde_json::from_slice(bytes).map_err(Error::Json)?;
        Ok(Box::new(value))
    }

    fn encode(&self, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, Error> {
        let value = value
            .downcast_ref::<T>()
            .ok_or_else(|| Error::DecodingError("codec type mismatch on encode".into()))?;
        serde_json::to_vec(value).map_err(Error::Json)
    }
}

/// The registry of known application-message codecs, keyed by tag.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<u8, Box<dyn MessageCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, codec: Box<dyn MessageCodec>) {
        self.codecs.insert(codec.tag(), codec);
    }

    pub fn max_length(&self, tag: u8) -> Option<usize> {
        self.codecs.get(&tag).and_then(|c| c.max_length())
    }

    pub fn decode(&self, tag: u8, bytes: &[u8]) -> Result<AppMessage, Error> {
        let codec = self
            .codecs
            .get(&tag)
            .ok_or_else(|| Error::DecodingError(format!("unregistered tag {tag:#x}")))?;
        Ok(AppMessage {
            tag,
            value: codec.decode(bytes)?,
        })
    }

    pub fn encode(&self, tag: u8, value: &(dyn Any + Send + Sync)) -> Result<Vec<u8>, Error> {
        let codec = self
            .codecs
            .get(&tag)
            .ok_or_else(|| Error::DecodingError(format!("unregistered tag {tag:#x}")))?;
        codec.encode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_round_trips() {
        let codec: JsonCodec<String> = JsonCodec::new(0x10, Some(1024));
        let encoded = codec.encode(&"hi".to_string()).unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(*decoded.downcast::<String>().unwrap(), "hi");
    }

    #[test]
    fn reserved_tags_are_rejected_as_unknown_user_message() {
        let err = Frame::decode(0x00, &[]).unwrap_err();
        assert!(matches!(err, Error::DecodingError(_)));
    }
}

//! Envelope wire encoding.
//!
//! Every frame starts with a one-byte version tag followed by the body of
//! that version:
//!
//! | tag    | body                                                      |
//! |--------|-----------------------------------------------------------|
//! | `0x01` | JSON object (`id`, `replyTo`, `replyOn`, `from`, `to`, `timestamp`, `message`) |
//! | `0x02` | protobuf `WireEnvelope` message                           |
//!
//! The tag makes version detection a lookup instead of trying every decoder
//! against the bytes.

use prost::Message as _;
use serde::{Deserialize, Serialize};

use crate::envelope::{Destination, Envelope};
use crate::error::{MqError, Result};

const ENCODE_ORIGIN: &str = "EnvelopeCodec.encode";
const DECODE_ORIGIN: &str = "EnvelopeCodec.decode";

/// Envelope schema versions understood by [`EnvelopeCodec`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireVersion {
    #[default]
    V1,
    V2,
}

impl WireVersion {
    pub const ALL: [WireVersion; 2] = [WireVersion::V1, WireVersion::V2];

    pub fn tag(self) -> u8 {
        match self {
            WireVersion::V1 => 0x01,
            WireVersion::V2 => 0x02,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.tag() == tag)
    }
}

/// A decoded envelope together with the version it was encoded in, so that a
/// reply can be written in the same version as the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub envelope: Envelope,
    /// Version named by the frame's tag byte.
    pub version: WireVersion,
}

/// Turns envelopes into broker payloads and back.
pub trait Serializer: Send + Sync {
    fn encode(&self, envelope: &Envelope, version: WireVersion) -> Result<Vec<u8>>;

    /// Decodes a frame, detecting its version.
    ///
    /// Fails with [`MqError::UnknownMessageType`] when the frame is tagged with
    /// a version this serializer does not accept.
    fn decode(&self, bytes: &[u8]) -> Result<Decoded>;
}

/// Default [`Serializer`], accepting a configurable set of versions.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    known: Vec<WireVersion>,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    /// Codec accepting every version.
    pub fn new() -> Self {
        Self {
            known: WireVersion::ALL.to_vec(),
        }
    }

    /// Codec restricted to `versions`.
    pub fn with_versions(versions: impl IntoIterator<Item = WireVersion>) -> Self {
        let mut known: Vec<WireVersion> = Vec::new();
        for v in versions {
            if !known.contains(&v) {
                known.push(v);
            }
        }
        Self { known }
    }

    pub fn known_versions(&self) -> &[WireVersion] {
        &self.known
    }
}

impl Serializer for EnvelopeCodec {
    fn encode(&self, envelope: &Envelope, version: WireVersion) -> Result<Vec<u8>> {
        if !self.known.contains(&version) {
            return Err(MqError::codec(
                ENCODE_ORIGIN,
                format!("version {version:?} is not enabled"),
            ));
        }
        let mut frame = vec![version.tag()];
        match version {
            WireVersion::V1 => {
                serde_json::to_writer(&mut frame, envelope)
                    .map_err(|e| MqError::codec(ENCODE_ORIGIN, e))?;
            }
            WireVersion::V2 => encode_binary(envelope, &mut frame),
        }
        Ok(frame)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| MqError::UnknownMessageType {
                origin: DECODE_ORIGIN.to_string(),
                tag: None,
            })?;
        let version = WireVersion::from_tag(tag)
            .filter(|v| self.known.contains(v))
            .ok_or_else(|| MqError::UnknownMessageType {
                origin: DECODE_ORIGIN.to_string(),
                tag: Some(tag),
            })?;
        let envelope = match version {
            WireVersion::V1 => {
                serde_json::from_slice(body).map_err(|e| MqError::codec(DECODE_ORIGIN, e))?
            }
            WireVersion::V2 => decode_binary(body)?,
        };
        Ok(Decoded { envelope, version })
    }
}

/// Protobuf body of a `V2` frame.
#[derive(Clone, PartialEq, prost::Message)]
struct WireEnvelope {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, tag = "2")]
    reply_to: String,
    #[prost(message, optional, tag = "3")]
    reply_on: Option<WireDestination>,
    #[prost(string, tag = "4")]
    from: String,
    #[prost(string, tag = "5")]
    to: String,
    #[prost(int64, tag = "6")]
    timestamp: i64,
    #[prost(bytes = "vec", tag = "7")]
    message: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
struct WireDestination {
    #[prost(string, tag = "1")]
    queue: String,
    #[prost(string, tag = "2")]
    topic: String,
    #[prost(string, tag = "3")]
    exchange: String,
}

impl From<&Envelope> for WireEnvelope {
    fn from(env: &Envelope) -> Self {
        Self {
            id: env.id.clone(),
            reply_to: env.reply_to.clone(),
            reply_on: Some(WireDestination {
                queue: env.reply_on.queue.clone(),
                topic: env.reply_on.topic.clone(),
                exchange: env.reply_on.exchange.clone(),
            }),
            from: env.from.clone(),
            to: env.to.clone(),
            timestamp: env.timestamp_ms,
            message: env.payload.clone(),
        }
    }
}

impl From<WireEnvelope> for Envelope {
    fn from(wire: WireEnvelope) -> Self {
        let reply_on = wire
            .reply_on
            .map(|d| Destination {
                queue: d.queue,
                topic: d.topic,
                exchange: d.exchange,
            })
            .unwrap_or_default();
        Self {
            id: wire.id,
            reply_to: wire.reply_to,
            reply_on,
            from: wire.from,
            to: wire.to,
            timestamp_ms: wire.timestamp,
            payload: wire.message,
        }
    }
}

fn encode_binary(env: &Envelope, out: &mut Vec<u8>) {
    out.extend_from_slice(&WireEnvelope::from(env).encode_to_vec());
}

fn decode_binary(body: &[u8]) -> Result<Envelope> {
    WireEnvelope::decode(body)
        .map(Envelope::from)
        .map_err(|e| MqError::codec(DECODE_ORIGIN, e))
}

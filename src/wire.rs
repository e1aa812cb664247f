//! Wire frames and stream framing.
//!
//! A single frame type carries everything peers exchange: subscription
//! announcements, published messages, and a control block with the
//! IHAVE/IWANT/GRAFT/PRUNE lists. Frames are bincode-encoded with a hard
//! deserialization limit and carried over the stream as unsigned-varint
//! length-delimited records.

use std::fmt;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::identity::PeerId;

/// Identifier a message is deduplicated and gossiped under.
///
/// By default the concatenation of the origin identity and the sequence
/// number; topics may install a content-derived function instead.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub Vec<u8>);

impl MessageId {
    /// The default ID function: `from || seqno`.
    pub fn from_origin(from: &PeerId, seqno: u64) -> Self {
        let mut bytes = Vec::with_capacity(40);
        bytes.extend_from_slice(from.as_bytes());
        bytes.extend_from_slice(&seqno.to_be_bytes());
        Self(bytes)
    }

    /// Content-derived ID: a blake3 digest over the canonical message
    /// bytes (`from || seqno || topic || data`). Stable across every relay
    /// path, so a tampered copy of a message gets a fresh identity instead
    /// of shadowing the original in the seen cache.
    pub fn from_content(msg: &Message) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(msg.from.as_bytes());
        hasher.update(&msg.seqno.to_be_bytes());
        hasher.update(msg.topic.as_bytes());
        hasher.update(&msg.data);
        Self(hasher.finalize().as_bytes().to_vec())
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(8)])
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.short())
    }
}

/// A published application message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Origin identity (not necessarily the peer that relayed the message).
    pub from: PeerId,
    /// Origin-scoped sequence number.
    pub seqno: u64,
    pub topic: String,
    pub data: Vec<u8>,
    /// Signature over the canonical serialization, when signing is enabled.
    pub signature: Option<Vec<u8>>,
    /// Verifying key, for schemes where it is not recoverable from `from`.
    pub key: Option<Vec<u8>>,
}

/// Subscription announcement: `subscribe` is false for an unsubscribe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOpts {
    pub subscribe: bool,
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIHave {
    pub topic: String,
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIWant {
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlGraft {
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPrune {
    pub topic: String,
    /// Peer exchange: members of the topic the pruned peer may dial instead.
    pub peers: Vec<PeerId>,
    /// Backoff the pruned peer must respect before re-grafting, in seconds.
    pub backoff_secs: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlBlock {
    pub ihave: Vec<ControlIHave>,
    pub iwant: Vec<ControlIWant>,
    pub graft: Vec<ControlGraft>,
    pub prune: Vec<ControlPrune>,
}

impl ControlBlock {
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty()
            && self.iwant.is_empty()
            && self.graft.is_empty()
            && self.prune.is_empty()
    }
}

/// One frame on a peer stream. Any combination of the three sections may be
/// present; an entirely empty frame is valid and ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFrame {
    pub subscriptions: Vec<SubOpts>,
    pub messages: Vec<Message>,
    pub control: Option<ControlBlock>,
}

impl RpcFrame {
    pub fn subscription(topic: &str, subscribe: bool) -> Self {
        Self {
            subscriptions: vec![SubOpts {
                subscribe,
                topic: topic.to_string(),
            }],
            ..Default::default()
        }
    }

    pub fn publish(message: Message) -> Self {
        Self {
            messages: vec![message],
            ..Default::default()
        }
    }

    pub fn control(control: ControlBlock) -> Self {
        Self {
            control: Some(control),
            ..Default::default()
        }
    }

    /// True when the frame carries only gossip/control payload, used by the
    /// send-queue drop policy.
    pub fn is_control_only(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Errors surfaced by the frame codec. Oversize and malformed frames are
/// protocol errors attributable to the remote peer.
#[derive(Debug)]
pub enum WireError {
    /// Declared frame length exceeds the transmission limit.
    Oversize { declared: u64, limit: usize },
    /// Varint length prefix is malformed.
    BadLengthPrefix,
    /// Frame body failed to decode.
    Codec(bincode::Error),
    Io(std::io::Error),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversize { declared, limit } => {
                write!(f, "frame of {declared} bytes exceeds limit of {limit}")
            }
            Self::BadLengthPrefix => write!(f, "malformed varint length prefix"),
            Self::Codec(e) => write!(f, "frame decode failed: {e}"),
            Self::Io(e) => write!(f, "stream error: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// bincode options with the deserialization limit enforced. All frame
/// decoding goes through this to bound allocation from hostile input.
fn frame_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

pub fn encode_frame(frame: &RpcFrame, limit: usize) -> Result<Vec<u8>, WireError> {
    frame_options(limit).serialize(frame).map_err(WireError::Codec)
}

pub fn decode_frame(bytes: &[u8], limit: usize) -> Result<RpcFrame, WireError> {
    decode_bounded(bytes, limit)
}

fn decode_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, WireError> {
    frame_options(limit).deserialize(bytes).map_err(WireError::Codec)
}

/// Write one length-delimited frame.
pub async fn write_frame<W>(writer: &mut W, frame: &RpcFrame, limit: usize) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_frame(frame, limit)?;
    if body.len() > limit {
        return Err(WireError::Oversize {
            declared: body.len() as u64,
            limit,
        });
    }
    let mut prefix = [0u8; 10];
    let n = encode_varint(body.len() as u64, &mut prefix);
    writer.write_all(&prefix[..n]).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-delimited frame. The declared length is checked against
/// the transmission limit before any body bytes are read.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> Result<RpcFrame, WireError>
where
    R: AsyncRead + Unpin,
{
    let declared = read_varint(reader).await?;
    if declared > limit as u64 {
        return Err(WireError::Oversize { declared, limit });
    }
    let mut body = vec![0u8; declared as usize];
    reader.read_exact(&mut body).await?;
    decode_frame(&body, limit)
}

fn encode_varint(mut value: u64, buf: &mut [u8; 10]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return i + 1;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, WireError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8().await?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift >= 64 {
            return Err(WireError::BadLengthPrefix);
        }
    }
}

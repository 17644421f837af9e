//! Discovery protocol codec
//!
//! Disco messages validate direct paths between peers. They travel inside
//! ordinary UDP datagrams (or relay frames) and are recognized by a magic
//! prefix before the data plane ever sees them.
//!
//! # Packet Layout
//!
//! ```text
//! ┌────────────┬────────────────────────┬──────────────────────────────┐
//! │ magic (6)  │ sender disco key (32)  │ sealed box                   │
//! │ "PS💬"     │                        │ nonce(12) ct tag(16)         │
//! └────────────┴────────────────────────┴──────────────────────────────┘
//!
//! box plaintext: type(1) | version(1) | bincode body
//! ```
//!
//! # Messages
//!
//! ```text
//! A                                        B
//! │── Ping { tx_id, node_key } ───────────►│  (UDP or relay)
//! │◄────────── Pong { tx_id, src } ────────│  (to the ping's source)
//! │── CallMeMaybe { my_number } ──────────►│  (relay only)
//! ```

use std::fmt;
use std::net::SocketAddr;

use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::key::{DiscoPublic, DiscoShared, NodePublic, KEY_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Magic prefix of every disco packet: "PS" followed by U+1F4AC
pub const MAGIC: &[u8; 6] = b"PS\xf0\x9f\x92\xac";

/// Length of the unsealed header (magic + sender disco key)
pub const HEADER_LEN: usize = MAGIC.len() + KEY_LEN;

/// Length of a transaction ID in bytes
pub const TX_ID_LEN: usize = 12;

/// Current payload version
pub const VERSION: u8 = 0;

const TYPE_PING: u8 = 0x01;
const TYPE_PONG: u8 = 0x02;
const TYPE_CALL_ME_MAYBE: u8 = 0x03;

/// Transaction ID matching a Pong to its Ping
pub type TxId = [u8; TX_ID_LEN];

// ============================================================================
// Messages
// ============================================================================

/// A disco control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Path probe
    Ping(Ping),
    /// Reply to a ping, sent back to the ping's source
    Pong(Pong),
    /// Hint that the sender just probed us at these addresses
    CallMeMaybe(CallMeMaybe),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub tx_id: TxId,
    /// Sender's identity key; disambiguates nodes sharing a disco key
    pub node_key: Option<NodePublic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub tx_id: TxId,
    /// Source address of the ping as the responder saw it
    pub src: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMeMaybe {
    /// The sender's own candidate endpoints
    pub my_number: Vec<SocketAddr>,
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Message::Ping(_) => TYPE_PING,
            Message::Pong(_) => TYPE_PONG,
            Message::CallMeMaybe(_) => TYPE_CALL_ME_MAYBE,
        }
    }

    /// Serialize to box plaintext.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DiscoError> {
        let body = match self {
            Message::Ping(m) => bincode::serialize(m),
            Message::Pong(m) => bincode::serialize(m),
            Message::CallMeMaybe(m) => bincode::serialize(m),
        }
        .map_err(|e| DiscoError::Malformed(e.to_string()))?;

        let mut out = Vec::with_capacity(2 + body.len());
        out.push(self.type_byte());
        out.push(VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse box plaintext. Newer versions with a known type are accepted
    /// as long as the body still decodes.
    pub fn parse(buf: &[u8]) -> Result<Self, DiscoError> {
        if buf.len() < 2 {
            return Err(DiscoError::TooShort(buf.len()));
        }
        let body = &buf[2..];
        let malformed = |e: bincode::Error| DiscoError::Malformed(e.to_string());
        match buf[0] {
            TYPE_PING => Ok(Message::Ping(bincode::deserialize(body).map_err(malformed)?)),
            TYPE_PONG => Ok(Message::Pong(bincode::deserialize(body).map_err(malformed)?)),
            TYPE_CALL_ME_MAYBE => Ok(Message::CallMeMaybe(
                bincode::deserialize(body).map_err(malformed)?,
            )),
            other => Err(DiscoError::UnknownType(other)),
        }
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        match self {
            Message::Ping(m) => format!("ping tx={}", hex::encode(&m.tx_id[..6])),
            Message::Pong(m) => format!("pong tx={} src={}", hex::encode(&m.tx_id[..6]), m.src),
            Message::CallMeMaybe(m) => format!("call-me-maybe {} endpoints", m.my_number.len()),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur while encoding or decoding disco packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoError {
    /// Buffer shorter than required
    TooShort(usize),
    /// Magic prefix missing
    BadMagic,
    /// Box failed to open (wrong or stale key, or tampering)
    OpenFailed,
    /// Sealing failed
    SealFailed,
    /// Message type this version does not understand
    UnknownType(u8),
    /// Body failed to decode
    Malformed(String),
}

impl fmt::Display for DiscoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoError::TooShort(len) => write!(f, "disco packet too short ({} bytes)", len),
            DiscoError::BadMagic => write!(f, "missing disco magic"),
            DiscoError::OpenFailed => write!(f, "failed to open disco box"),
            DiscoError::SealFailed => write!(f, "failed to seal disco box"),
            DiscoError::UnknownType(t) => write!(f, "unknown disco message type {:#04x}", t),
            DiscoError::Malformed(e) => write!(f, "malformed disco message: {}", e),
        }
    }
}

impl std::error::Error for DiscoError {}

// ============================================================================
// Packet Encoding
// ============================================================================

/// Generate a random transaction ID
pub fn new_tx_id() -> TxId {
    let mut tx_id = [0u8; TX_ID_LEN];
    // Only fails when the OS RNG is unavailable.
    if SystemRandom::new().fill(&mut tx_id).is_err() {
        log::error!("system RNG unavailable for disco tx id");
    }
    tx_id
}

/// Cheap check used on the hot receive path before any lookup.
///
/// Returns the sender's disco key when `pkt` carries the disco magic.
pub fn source_disco_key(pkt: &[u8]) -> Option<DiscoPublic> {
    if pkt.len() < HEADER_LEN || &pkt[..MAGIC.len()] != MAGIC {
        return None;
    }
    DiscoPublic::from_slice(&pkt[MAGIC.len()..HEADER_LEN])
}

/// Whether `pkt` looks like a disco packet
pub fn looks_like_disco(pkt: &[u8]) -> bool {
    source_disco_key(pkt).is_some()
}

/// Build a complete sealed disco packet from `sender` to the peer sharing `shared`.
pub fn encode_packet(
    sender: &DiscoPublic,
    shared: &DiscoShared,
    msg: &Message,
) -> Result<Vec<u8>, DiscoError> {
    let plain = msg.to_bytes()?;
    let sealed = shared.seal(&plain).map_err(|_| DiscoError::SealFailed)?;

    let mut pkt = Vec::with_capacity(HEADER_LEN + sealed.len());
    pkt.extend_from_slice(MAGIC);
    pkt.extend_from_slice(sender.as_bytes());
    pkt.extend_from_slice(&sealed);
    Ok(pkt)
}

/// Open and parse the sealed part of a disco packet.
pub fn decode_packet(pkt: &[u8], shared: &DiscoShared) -> Result<Message, DiscoError> {
    if pkt.len() < HEADER_LEN {
        return Err(DiscoError::TooShort(pkt.len()));
    }
    if &pkt[..MAGIC.len()] != MAGIC {
        return Err(DiscoError::BadMagic);
    }
    let plain = shared.open(&pkt[HEADER_LEN..]).ok_or(DiscoError::OpenFailed)?;
    Message::parse(&plain)
}

// ============================================================================
// Tests
// ============================================================================

//! Binary wire protocol for document sync and presence.
//!
//! Wire format (lib0 variable-length integers, y-protocols compatible):
//! ```text
//! ┌──────────┬─────────────────────────────────────────────────┐
//! │ msg_type │ payload                                         │
//! │ varuint  │ SYNC (0):      varuint step │ varbytes body      │
//! │          │ AWARENESS (1): varbytes awareness update        │
//! └──────────┴─────────────────────────────────────────────────┘
//! ```
//!
//! Sync steps:
//! - `0` step 1 — sender's encoded state vector
//! - `1` step 2 — update holding everything the receiver is missing
//! - `2` update — incremental delta from a single transaction
//!
//! Payload bodies are opaque here: state vectors and updates are interpreted
//! by [`crate::document`], awareness updates by [`crate::presence`].

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Top-level frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    /// Document replication (step 1 / step 2 / update)
    Sync = 0,
    /// Ephemeral presence diff
    Awareness = 1,
}

impl MessageType {
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            _ => None,
        }
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}

const STEP1: u32 = 0;
const STEP2: u32 = 1;
const UPDATE: u32 = 2;

/// One exchange step of the replication protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender.
    Step1(Vec<u8>),
    /// Encoded update answering a step 1.
    Step2(Vec<u8>),
    /// Encoded incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn step(&self) -> u32 {
        match self {
            SyncMessage::Step1(_) => STEP1,
            SyncMessage::Step2(_) => STEP2,
            SyncMessage::Update(_) => UPDATE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            SyncMessage::Step1(p) | SyncMessage::Step2(p) | SyncMessage::Update(p) => p,
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Raw awareness update, see [`crate::presence::AwarenessUpdate`].
    Awareness(Vec<u8>),
}

impl Message {
    /// Server handshake: our state vector.
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Step1(state_vector))
    }

    /// Reply to a peer's step 1 with the history it lacks.
    pub fn sync_step2(update: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Step2(update))
    }

    /// Incremental delta relayed to peers.
    pub fn update(update: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Update(update))
    }

    pub fn awareness(update: Vec<u8>) -> Self {
        Message::Awareness(update)
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Sync(_) => MessageType::Sync,
            Message::Awareness(_) => MessageType::Awareness,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload_len() + 8);
        buf.write_var(self.message_type().tag());
        match self {
            Message::Sync(sync) => {
                buf.write_var(sync.step());
                buf.write_buf(sync.payload());
            }
            Message::Awareness(update) => {
                buf.write_buf(update);
            }
        }
        buf
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        let mut cursor = Cursor::new(bytes);
        let tag: u32 = cursor.read_var()?;
        match MessageType::from_tag(tag) {
            Some(MessageType::Sync) => {
                let step: u32 = cursor.read_var()?;
                let body = cursor.read_buf()?.to_vec();
                let sync = match step {
                    STEP1 => SyncMessage::Step1(body),
                    STEP2 => SyncMessage::Step2(body),
                    UPDATE => SyncMessage::Update(body),
                    other => return Err(ProtocolError::UnknownSyncStep(other)),
                };
                Ok(Message::Sync(sync))
            }
            Some(MessageType::Awareness) => {
                let update = cursor.read_buf()?.to_vec();
                Ok(Message::Awareness(update))
            }
            None => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Message::Sync(sync) => sync.payload().len(),
            Message::Awareness(update) => update.len(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("unknown sync step {0}")]
    UnknownSyncStep(u32),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<yrs::encoding::read::Error> for ProtocolError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

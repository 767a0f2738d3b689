//! Binary wire protocol: varint primitives and the SYNC/AWARENESS frame
//! families.
//!
//! Every frame starts with a one-byte top-level type. SYNC frames carry a
//! subtype byte followed by a length-prefixed payload; AWARENESS frames carry
//! a single length-prefixed opaque blob that is forwarded verbatim to peers.
//! The same varint/length-prefix framing is reused by the storage layer.

/// Top-level message type (first byte of a binary frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum YMessageType {
    /// Sync protocol (step 1/2, updates)
    Sync = 0,
    /// Awareness protocol (cursors, presence)
    Awareness = 1,
}

impl TryFrom<u8> for YMessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(YMessageType::Sync),
            1 => Ok(YMessageType::Awareness),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Sync message subtype (second byte when the top-level type is Sync).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum YSyncMessageType {
    /// A peer's state vector, requesting the diff it is missing
    SyncStep1 = 0,
    /// The diff computed against a received state vector
    SyncStep2 = 1,
    /// An incremental document update
    SyncUpdate = 2,
}

impl TryFrom<u8> for YSyncMessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(YSyncMessageType::SyncStep1),
            1 => Ok(YSyncMessageType::SyncStep2),
            2 => Ok(YSyncMessageType::SyncUpdate),
            _ => Err(ProtocolError::UnknownSyncType(value)),
        }
    }
}

/// Decoded SYNC frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Step 1: the peer's state vector
    Step1(Vec<u8>),
    /// Step 2: diff update to apply locally
    Step2(Vec<u8>),
    /// Incremental update to apply locally
    Update(Vec<u8>),
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YMessage {
    Sync(SyncMessage),
    /// Awareness payload, forwarded verbatim
    Awareness(Vec<u8>),
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("unknown sync message type: {0}")]
    UnknownSyncType(u8),
    #[error("unexpected end of message")]
    UnexpectedEof,
    #[error("varint exceeds 64 bits")]
    VarIntOverflow,
}

/// Encode a variable-length unsigned integer (little-endian base 128).
pub fn write_var_uint(value: u64, out: &mut Vec<u8>) {
    let mut v = value;
    while v > 127 {
        out.push(0x80 | (v & 0x7F) as u8);
        v >>= 7;
    }
    out.push(v as u8);
}

/// Append a length-prefixed byte string.
pub fn write_var_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    write_var_uint(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

/// Cursor over a byte stream of varints and length-prefixed messages.
pub struct Decoder<'a> {
    stream: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(stream: &'a [u8]) -> Self {
        Self { stream }
    }

    /// Remaining unread bytes.
    pub fn remaining(&self) -> usize {
        self.stream.len()
    }

    /// Decode the next variable-length unsigned integer.
    pub fn read_var_uint(&mut self) -> Result<u64, ProtocolError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let (&byte, rest) = self
                .stream
                .split_first()
                .ok_or(ProtocolError::UnexpectedEof)?;
            self.stream = rest;
            if shift > 63 {
                return Err(ProtocolError::VarIntOverflow);
            }
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Read the next length-prefixed message, or `None` once the input is
    /// exhausted. A zero-length prefix yields an empty message.
    pub fn read_message(&mut self) -> Result<Option<&'a [u8]>, ProtocolError> {
        if self.stream.is_empty() {
            return Ok(None);
        }
        let len = self.read_var_uint()? as usize;
        if len > self.stream.len() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let (message, rest) = self.stream.split_at(len);
        self.stream = rest;
        Ok(Some(message))
    }

    /// Drain the input as a sequence of length-prefixed messages.
    pub fn read_messages(
        &mut self,
    ) -> impl Iterator<Item = Result<&'a [u8], ProtocolError>> + '_ {
        std::iter::from_fn(move || self.read_message().transpose())
    }
}

fn create_sync_message(data: &[u8], msg_type: YSyncMessageType) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 5 + data.len());
    out.push(YMessageType::Sync as u8);
    out.push(msg_type as u8);
    write_var_bytes(data, &mut out);
    out
}

/// Encode a SyncStep1 frame carrying a state vector.
pub fn create_sync_step1_message(state_vector: &[u8]) -> Vec<u8> {
    create_sync_message(state_vector, YSyncMessageType::SyncStep1)
}

/// Encode a SyncStep2 frame carrying a diff update.
pub fn create_sync_step2_message(update: &[u8]) -> Vec<u8> {
    create_sync_message(update, YSyncMessageType::SyncStep2)
}

/// Encode an incremental update frame.
pub fn create_update_message(update: &[u8]) -> Vec<u8> {
    create_sync_message(update, YSyncMessageType::SyncUpdate)
}

/// Encode an awareness frame.
pub fn create_awareness_message(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 5 + payload.len());
    out.push(YMessageType::Awareness as u8);
    write_var_bytes(payload, &mut out);
    out
}

impl YMessage {
    /// Parse a binary frame. `Ok(None)` means the top-level type byte is
    /// unknown; callers drop such frames for forward compatibility.
    pub fn parse(frame: &[u8]) -> Result<Option<YMessage>, ProtocolError> {
        let (&type_byte, rest) = frame.split_first().ok_or(ProtocolError::UnexpectedEof)?;
        let msg_type = match YMessageType::try_from(type_byte) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };
        match msg_type {
            YMessageType::Sync => {
                let (&sub, rest) = rest.split_first().ok_or(ProtocolError::UnexpectedEof)?;
                let sync_type = YSyncMessageType::try_from(sub)?;
                let mut decoder = Decoder::new(rest);
                let payload = decoder
                    .read_message()?
                    .ok_or(ProtocolError::UnexpectedEof)?
                    .to_vec();
                Ok(Some(YMessage::Sync(match sync_type {
                    YSyncMessageType::SyncStep1 => SyncMessage::Step1(payload),
                    YSyncMessageType::SyncStep2 => SyncMessage::Step2(payload),
                    YSyncMessageType::SyncUpdate => SyncMessage::Update(payload),
                })))
            }
            YMessageType::Awareness => {
                let mut decoder = Decoder::new(rest);
                let payload = decoder
                    .read_message()?
                    .ok_or(ProtocolError::UnexpectedEof)?
                    .to_vec();
                Ok(Some(YMessage::Awareness(payload)))
            }
        }
    }
}

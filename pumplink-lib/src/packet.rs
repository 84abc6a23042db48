use crate::constants::{CHUNK_HEADER_SIZE, CHUNK_PAYLOAD_SIZE, MAX_CHUNKS_PER_MESSAGE};
use crate::error::PumpError;
use bytes::{Bytes, BytesMut};
use modular_bitfield::prelude::*;

/// Two-byte header in front of every transport chunk.
///
/// The low nibble of byte 0 counts the chunks still to come for this
/// message; 0 marks the last one. Byte 1 is the transaction id.
#[bitfield(bytes = 2)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkHeader {
    pub remaining: B4,
    #[skip]
    reserved: B4,
    pub tx_id: u8,
}

impl ChunkHeader {
    pub fn parse(chunk: &[u8]) -> Option<Self> {
        let bytes: [u8; CHUNK_HEADER_SIZE] = chunk.get(..CHUNK_HEADER_SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(bytes))
    }
}

/// Rebuilds one logical message out of transport chunks.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
    tx_id: Option<u8>,
    complete: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns true once the chunk with a zero remaining
    /// nibble has arrived.
    ///
    /// Chunks shorter than the header are ignored. A chunk for a different
    /// transaction than the one in progress drops the buffered payload and
    /// starts over with the new transaction.
    pub fn feed(&mut self, chunk: &[u8]) -> bool {
        let Some(header) = ChunkHeader::parse(chunk) else {
            return false;
        };

        if self.complete {
            self.reset();
        }

        match self.tx_id {
            Some(current) if current != header.tx_id() => {
                tracing::debug!(
                    abandoned = current,
                    incoming = header.tx_id(),
                    dropped = self.buffer.len(),
                    "transaction id changed mid-message, restarting reassembly"
                );
                self.buffer.clear();
            }
            _ => {}
        }

        self.tx_id = Some(header.tx_id());
        self.buffer.extend_from_slice(&chunk[CHUNK_HEADER_SIZE..]);

        if header.remaining() == 0 {
            self.complete = true;
        }
        self.complete
    }

    /// The reassembled payload. Only meaningful right after `feed` returned true.
    pub fn assemble(&mut self) -> Bytes {
        let message = self.buffer.split().freeze();
        self.tx_id = None;
        self.complete = false;
        message
    }

    /// Transaction id of the message being assembled, if any.
    pub fn tx_id(&self) -> Option<u8> {
        self.tx_id
    }

    pub fn is_active(&self) -> bool {
        self.tx_id.is_some() && !self.complete
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.tx_id = None;
        self.complete = false;
    }
}

/// Split a message into transport chunks sharing `tx_id`, with the
/// remaining nibble counting down to 0 on the last chunk.
pub fn fragment(tx_id: u8, message: &[u8]) -> Result<Vec<Bytes>, PumpError> {
    let count = message.len().div_ceil(CHUNK_PAYLOAD_SIZE).max(1);
    if count > MAX_CHUNKS_PER_MESSAGE {
        return Err(PumpError::MessageTooLarge(message.len()));
    }

    let mut chunks = Vec::with_capacity(count);
    let mut parts = message.chunks(CHUNK_PAYLOAD_SIZE);
    for index in 0..count {
        let part = parts.next().unwrap_or(&[]);
        let header = ChunkHeader::new()
            .with_remaining((count - 1 - index) as u8)
            .with_tx_id(tx_id);
        let mut chunk = BytesMut::with_capacity(CHUNK_HEADER_SIZE + part.len());
        chunk.extend_from_slice(&header.into_bytes());
        chunk.extend_from_slice(part);
        chunks.push(chunk.freeze());
    }
    Ok(chunks)
}

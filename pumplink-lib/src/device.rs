use crate::error::PumpError;
use crate::message::{Characteristic, Envelope, MessageKind};
use crate::packet::Reassembler;
use crate::transport::{ChunkTransport, ConnectionState};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

// Default wait for a complete response message
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

// Messages held for a characteristic nobody is reading yet
const MAX_PENDING_MESSAGES: usize = 16;

fn is_stream(characteristic: Characteristic, envelope: &Envelope) -> bool {
    characteristic == Characteristic::HistoryLog && envelope.opcode == MessageKind::HistoryLogStream.response_opcode()
}

/// One request/response conversation with the pump over a chunk transport.
///
/// Requests are strictly sequential: `transact` sends a request and waits
/// for its matching response before returning, so callers sharing a session
/// put it behind a mutex.
pub struct PumpSession<T> {
    transport: T,
    transaction_id: u8,
    reassemblers: HashMap<Characteristic, Reassembler>,
    pending: VecDeque<(Characteristic, Envelope)>,
    response_timeout: Duration,
    connection: Option<watch::Receiver<ConnectionState>>,
}

impl<T: ChunkTransport> PumpSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            transaction_id: 0,
            reassemblers: HashMap::new(),
            pending: VecDeque::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            connection: None,
        }
    }

    pub fn with_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// Refuse to send while the link reports anything but connected.
    pub fn with_connection_state(mut self, connection: watch::Receiver<ConnectionState>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_none_or(|state| state.borrow().is_connected())
    }

    /// Get the next transaction ID
    pub fn next_transaction_id(&mut self) -> u8 {
        let id = self.transaction_id;
        self.transaction_id = self.transaction_id.wrapping_add(1);
        id
    }

    /// Drop partial messages and anything queued, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.reassemblers.clear();
        self.pending.clear();
    }

    /// Send a request and return the cargo of its response.
    pub async fn request(&mut self, kind: MessageKind, cargo: Bytes) -> Result<Bytes, PumpError> {
        let tx_id = self.next_transaction_id();
        let chunks = Envelope::request(kind, tx_id, cargo)?.to_chunks()?;
        self.transact(kind, tx_id, chunks).await
    }

    /// Send pre-built chunks for `kind` and wait for the response carrying
    /// the same transaction id.
    ///
    /// Anything else arriving on the characteristic before the deadline, such
    /// as the late answer to a request that already timed out, is dropped.
    pub async fn transact(&mut self, kind: MessageKind, tx_id: u8, chunks: Vec<Bytes>) -> Result<Bytes, PumpError> {
        let characteristic = kind.characteristic();
        // queued messages on this characteristic belong to earlier exchanges
        self.pending.retain(|(c, _)| *c != characteristic);
        self.send_chunks(characteristic, chunks).await?;

        let limit = self.response_timeout;
        let response = timeout(limit, self.read_response(characteristic, kind.response_opcode(), tx_id)).await??;
        debug!(%kind, tx_id, cargo_len = response.cargo.len(), "response received");
        Ok(response.cargo)
    }

    /// Next pushed history-log stream message for `stream_id`.
    pub async fn receive_stream(&mut self, stream_id: u8) -> Result<Bytes, PumpError> {
        let limit = self.response_timeout;
        timeout(limit, self.read_stream(stream_id)).await?
    }

    async fn send_chunks(&mut self, characteristic: Characteristic, chunks: Vec<Bytes>) -> Result<(), PumpError> {
        for chunk in chunks {
            if !self.is_connected() {
                return Err(PumpError::NotConnected);
            }
            trace!(%characteristic, chunk = %hex::encode(&chunk), "tx");
            self.transport.write_chunk(characteristic, chunk).await?;
        }
        Ok(())
    }

    async fn read_response(
        &mut self,
        characteristic: Characteristic,
        opcode: u8,
        tx_id: u8,
    ) -> Result<Envelope, PumpError> {
        loop {
            let envelope = self.read_message(characteristic).await?;
            if envelope.opcode == opcode && envelope.tx_id == tx_id {
                return Ok(envelope);
            }
            if is_stream(characteristic, &envelope) {
                self.queue(characteristic, envelope);
                continue;
            }
            debug!(
                %characteristic,
                opcode = envelope.opcode,
                tx_id = envelope.tx_id,
                expected_tx_id = tx_id,
                "dropping stale response"
            );
        }
    }

    async fn read_stream(&mut self, stream_id: u8) -> Result<Bytes, PumpError> {
        let characteristic = Characteristic::HistoryLog;
        loop {
            let envelope = match self.take_pending(characteristic) {
                Some(envelope) => envelope,
                None => self.read_message(characteristic).await?,
            };
            if is_stream(characteristic, &envelope) && envelope.cargo.get(1) == Some(&stream_id) {
                return Ok(envelope.cargo);
            }
            debug!(opcode = envelope.opcode, tx_id = envelope.tx_id, stream_id, "dropping stale history message");
        }
    }

    fn take_pending(&mut self, characteristic: Characteristic) -> Option<Envelope> {
        let index = self.pending.iter().position(|(c, _)| *c == characteristic)?;
        self.pending.remove(index).map(|(_, envelope)| envelope)
    }

    fn queue(&mut self, characteristic: Characteristic, envelope: Envelope) {
        if self.pending.len() >= MAX_PENDING_MESSAGES {
            if let Some((dropped, old)) = self.pending.pop_front() {
                warn!(characteristic = %dropped, opcode = old.opcode, "pending queue full, dropping oldest message");
            }
        }
        self.pending.push_back((characteristic, envelope));
    }

    /// Read until one complete message arrives on `characteristic`.
    /// Messages completing on other characteristics are queued.
    async fn read_message(&mut self, characteristic: Characteristic) -> Result<Envelope, PumpError> {
        loop {
            let (from, chunk) = self.transport.read_chunk().await?;
            trace!(characteristic = %from, chunk = %hex::encode(&chunk), "rx");
            let reassembler = self.reassemblers.entry(from).or_default();
            if !reassembler.feed(&chunk) {
                continue;
            }
            let envelope = Envelope::parse(reassembler.assemble())?;
            if from == characteristic {
                return Ok(envelope);
            }
            debug!(characteristic = %from, opcode = envelope.opcode, "queueing message for another characteristic");
            self.queue(from, envelope);
        }
    }
}

use crate::error::PumpError;
use crate::message::Characteristic;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use strum_macros::Display;

/// Link state as seen by the bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Delivers single chunks (at most 20 bytes) to and from the pump.
///
/// The bearer guarantees in-order delivery per characteristic; nothing here
/// retransmits.
pub trait ChunkTransport: Send + Sync {
    fn write_chunk(
        &self,
        characteristic: Characteristic,
        chunk: Bytes,
    ) -> impl Future<Output = Result<(), PumpError>> + Send;

    /// Next chunk from the pump and the characteristic it arrived on.
    fn read_chunk(&self) -> impl Future<Output = Result<(Characteristic, Bytes), PumpError>> + Send;
}

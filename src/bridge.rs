//! TCP client for a radio bridge that relays GATT chunks.
//!
//! Frames in both directions are `[characteristic u8][len u8][chunk]`.

use bytes::{BufMut, Bytes, BytesMut};
use pumplink_lib::constants::MAX_CHUNK_SIZE;
use pumplink_lib::message::Characteristic;
use pumplink_lib::{ChunkTransport, ConnectionState, PumpError};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INCOMING_QUEUE: usize = 256;

type Frame = (Characteristic, Bytes);

pub struct ChunkBridge {
    addr: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    incoming_tx: mpsc::Sender<Frame>,
    incoming: Mutex<mpsc::Receiver<Frame>>,
    state: Arc<watch::Sender<ConnectionState>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChunkBridge {
    /// Connect to the bridge at `addr` (host:port).
    pub async fn connect(addr: &str) -> Result<Self, PumpError> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_QUEUE);
        let bridge = Self {
            addr: addr.to_string(),
            writer: Mutex::new(None),
            incoming_tx,
            incoming: Mutex::new(incoming),
            state: Arc::new(state),
            reader: std::sync::Mutex::new(None),
        };
        bridge.reconnect().await?;
        Ok(bridge)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open a fresh connection, dropping anything left from the last one.
    pub async fn reconnect(&self) -> Result<(), PumpError> {
        self.state.send_replace(ConnectionState::Connecting);
        let stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        // the old reader must not feed frames or a disconnect into the new link
        if let Some(old) = self.take_reader() {
            old.abort();
            let _ = old.await;
        }
        {
            let mut incoming = self.incoming.lock().await;
            while incoming.try_recv().is_ok() {}
        }
        *self.writer.lock().await = Some(writer);
        let handle = tokio::spawn(read_frames(reader, self.incoming_tx.clone(), self.state.clone()));
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(handle);
        }

        info!(addr = %self.addr, "bridge connected");
        self.state.send_replace(ConnectionState::Connected);
        Ok(())
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Drop for ChunkBridge {
    fn drop(&mut self) {
        if let Some(reader) = self.take_reader() {
            reader.abort();
        }
    }
}

impl ChunkTransport for ChunkBridge {
    async fn write_chunk(&self, characteristic: Characteristic, chunk: Bytes) -> Result<(), PumpError> {
        let mut frame = BytesMut::with_capacity(2 + chunk.len());
        frame.put_u8(characteristic.into());
        frame.put_u8(chunk.len() as u8);
        frame.extend_from_slice(&chunk);

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(PumpError::NotConnected);
        };
        if let Err(e) = stream.write_all(&frame).await {
            warn!(error = %e, "bridge write failed");
            *writer = None;
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_chunk(&self) -> Result<(Characteristic, Bytes), PumpError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(PumpError::Transport("bridge reader closed".into()))
    }
}

async fn read_frames(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Frame>,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    loop {
        let mut header = [0u8; 2];
        if let Err(e) = reader.read_exact(&mut header).await {
            debug!(error = %e, "bridge read ended");
            break;
        }
        let mut chunk = vec![0u8; header[1] as usize];
        if let Err(e) = reader.read_exact(&mut chunk).await {
            debug!(error = %e, "bridge read ended mid-frame");
            break;
        }
        let Ok(characteristic) = Characteristic::try_from(header[0]) else {
            warn!(characteristic = header[0], "frame for unknown characteristic dropped");
            continue;
        };
        if chunk.len() > MAX_CHUNK_SIZE {
            warn!(len = chunk.len(), "oversized chunk dropped");
            continue;
        }
        if tx.send((characteristic, Bytes::from(chunk))).await.is_err() {
            break;
        }
    }
    info!("bridge disconnected");
    state.send_replace(ConnectionState::Disconnected);
}

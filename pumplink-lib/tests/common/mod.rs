//! Common test utilities: an in-memory chunk link and a scripted pump.

// Shared across test files; not every item is used by each of them
#![allow(dead_code)]

pub use bytes::Bytes;
pub use hex;

use pumplink_lib::constants::{EVENT_BOLUS_DELIVERY, JPAKE_ROUND1_HALF_SIZE};
use pumplink_lib::crypto::jpake::{JpakeEngine, Role};
use pumplink_lib::crypto::{derive_key, hmac_sha256};
use pumplink_lib::error::PumpError;
use pumplink_lib::message::{Characteristic, Direction, Envelope, MessageKind};
use pumplink_lib::packet::Reassembler;
use pumplink_lib::transport::ChunkTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

type Chunk = (Characteristic, Bytes);

/// Decode hex string to bytes for testing
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// Host end of an in-memory link.
pub struct MemoryTransport {
    to_pump: mpsc::UnboundedSender<Chunk>,
    from_pump: tokio::sync::Mutex<mpsc::UnboundedReceiver<Chunk>>,
}

impl ChunkTransport for MemoryTransport {
    async fn write_chunk(&self, characteristic: Characteristic, chunk: Bytes) -> Result<(), PumpError> {
        self.to_pump
            .send((characteristic, chunk))
            .map_err(|_| PumpError::Transport("pump end closed".into()))
    }

    async fn read_chunk(&self) -> Result<(Characteristic, Bytes), PumpError> {
        self.from_pump.lock().await.recv().await.ok_or(PumpError::NotConnected)
    }
}

/// Requests the pump has seen, with the (possibly paused) clock at arrival.
#[derive(Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<(MessageKind, Instant)>>>);

impl RequestLog {
    fn push(&self, kind: MessageKind) {
        self.0.lock().unwrap().push((kind, Instant::now()));
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        self.0.lock().unwrap().iter().map(|(k, _)| *k).collect()
    }

    pub fn times_of(&self, kind: MessageKind) -> Vec<Instant> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.times_of(kind).len()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

/// What the simulated pump answers with.
#[derive(Clone, Default)]
pub struct PumpScript {
    pub responses: HashMap<MessageKind, Bytes>,
    /// Encoded 26-byte history records, in sequence order.
    pub history: Vec<(u32, [u8; 26])>,
    pub pairing_code: Option<String>,
    /// Extra chunks pushed before every status response.
    pub noise: Vec<Chunk>,
    /// The first answer to each listed kind is held back this long.
    pub late: HashMap<MessageKind, Duration>,
}

impl PumpScript {
    pub fn respond(mut self, kind: MessageKind, cargo: impl Into<Bytes>) -> Self {
        self.responses.insert(kind, cargo.into());
        self
    }

    pub fn with_history(mut self, records: Vec<(u32, [u8; 26])>) -> Self {
        self.history = records;
        self
    }

    pub fn answer_late(mut self, kind: MessageKind, delay: Duration) -> Self {
        self.late.insert(kind, delay);
        self
    }

    pub fn with_pairing_code(mut self, code: &str) -> Self {
        self.pairing_code = Some(code.to_string());
        self
    }
}

/// Pump side of the JPAKE handshake.
struct PumpJpake {
    engine: JpakeEngine,
    round1: Bytes,
    client_first_half: Vec<u8>,
    secret: Option<[u8; 32]>,
    key: Option<[u8; 32]>,
}

impl PumpJpake {
    fn new(code: &str) -> Self {
        let engine = JpakeEngine::new(Role::Server, code.as_bytes()).unwrap();
        let round1 = engine.round1();
        Self {
            engine,
            round1,
            client_first_half: Vec::new(),
            secret: None,
            key: None,
        }
    }

    fn answer(&mut self, kind: MessageKind, cargo: &[u8]) -> Option<Vec<u8>> {
        let app_id = &cargo[..2];
        let mut out = app_id.to_vec();
        match kind {
            MessageKind::Jpake1a => {
                self.client_first_half = cargo[2..].to_vec();
                out.extend_from_slice(&self.round1[..JPAKE_ROUND1_HALF_SIZE]);
            }
            MessageKind::Jpake1b => {
                let mut full = self.client_first_half.clone();
                full.extend_from_slice(&cargo[2..]);
                self.engine.read_round1(&full).ok()?;
                out.extend_from_slice(&self.round1[JPAKE_ROUND1_HALF_SIZE..]);
            }
            MessageKind::Jpake2 => {
                self.engine.read_round2(&cargo[2..]).ok()?;
                self.secret = Some(self.engine.derive_secret().ok()?);
                out.extend_from_slice(&self.engine.round2().ok()?);
            }
            MessageKind::Jpake3SessionKey => {
                let nonce = [0x5A; 8];
                self.key = Some(derive_key(&nonce, &self.secret?));
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&[0; 8]);
            }
            MessageKind::Jpake4KeyConfirmation => {
                let nonce = [0x33; 8];
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&[0; 8]);
                out.extend_from_slice(&hmac_sha256(&self.key?, &nonce));
            }
            _ => return None,
        }
        Some(out)
    }
}

fn send(tx: &mpsc::UnboundedSender<Chunk>, kind: MessageKind, tx_id: u8, cargo: Vec<u8>) {
    let chunks = Envelope::response(kind, tx_id, Bytes::from(cargo))
        .and_then(|e| e.to_chunks())
        .unwrap();
    for chunk in chunks {
        let _ = tx.send((kind.characteristic(), chunk));
    }
}

/// Start a pump task answering from `script`.
pub fn spawn_pump(script: PumpScript) -> (MemoryTransport, RequestLog) {
    let (to_pump, mut pump_rx) = mpsc::unbounded_channel::<Chunk>();
    let (pump_tx, from_pump) = mpsc::unbounded_channel::<Chunk>();
    let log = RequestLog::default();
    let pump_log = log.clone();

    tokio::spawn(async move {
        let mut reassemblers: HashMap<Characteristic, Reassembler> = HashMap::new();
        let mut jpake = script.pairing_code.as_deref().map(PumpJpake::new);
        let mut late = script.late.clone();

        while let Some((characteristic, chunk)) = pump_rx.recv().await {
            let reassembler = reassemblers.entry(characteristic).or_default();
            if !reassembler.feed(&chunk) {
                continue;
            }
            let Ok(request) = Envelope::parse(reassembler.assemble()) else {
                continue;
            };
            let Some((kind, Direction::HostToDevice)) = MessageKind::lookup(characteristic, request.opcode) else {
                continue;
            };
            pump_log.push(kind);

            if kind.characteristic() == Characteristic::Authorization {
                if let Some(answer) = jpake.as_mut().and_then(|j| j.answer(kind, &request.cargo)) {
                    send(&pump_tx, kind, request.tx_id, answer);
                }
                continue;
            }

            for noise in &script.noise {
                let _ = pump_tx.send(noise.clone());
            }

            if kind == MessageKind::HistoryLog {
                let start = u32::from_le_bytes(request.cargo[..4].try_into().unwrap());
                let count = request.cargo[4] as u32;
                send(&pump_tx, kind, request.tx_id, vec![0, 1]);
                let records: Vec<_> = script
                    .history
                    .iter()
                    .filter(|(seq, _)| *seq >= start && *seq < start + count)
                    .map(|(_, bytes)| *bytes)
                    .collect();
                for batch in records.chunks(4) {
                    let mut cargo = vec![batch.len() as u8, 1];
                    for record in batch {
                        cargo.extend_from_slice(record);
                    }
                    send(&pump_tx, MessageKind::HistoryLogStream, request.tx_id, cargo);
                }
                if records.is_empty() {
                    send(&pump_tx, MessageKind::HistoryLogStream, request.tx_id, vec![0, 1]);
                }
                continue;
            }

            if let Some(cargo) = script.responses.get(&kind) {
                match late.remove(&kind) {
                    Some(delay) => {
                        let pump_tx = pump_tx.clone();
                        let (tx_id, cargo) = (request.tx_id, cargo.to_vec());
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            send(&pump_tx, kind, tx_id, cargo);
                        });
                    }
                    None => send(&pump_tx, kind, request.tx_id, cargo.to_vec()),
                }
            }
        }
    });

    let transport = MemoryTransport {
        to_pump,
        from_pump: tokio::sync::Mutex::new(from_pump),
    };
    (transport, log)
}

// --- cargo builders ---

pub fn iob_cargo(mode_a_mu: u32, mode_b_mu: u32, mode: u8) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&mode_a_mu.to_le_bytes());
    v.extend_from_slice(&3600u32.to_le_bytes());
    v.extend_from_slice(&4000u32.to_le_bytes());
    v.extend_from_slice(&mode_b_mu.to_le_bytes());
    v.push(mode);
    v
}

pub fn basal_cargo(profile_mu: u32, current_mu: u32, modified: u8) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&profile_mu.to_le_bytes());
    v.extend_from_slice(&current_mu.to_le_bytes());
    v.push(modified);
    v
}

pub fn cgm_cargo(timestamp: u32, glucose: u16, status: u8, trend_rate: i8) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&timestamp.to_le_bytes());
    v.extend_from_slice(&glucose.to_le_bytes());
    v.push(status);
    v.push(trend_rate as u8);
    v
}

pub fn home_screen_cargo(trend_icon: u8) -> Vec<u8> {
    vec![trend_icon, 0, 0, 0, 0, 0, 0, 0, 1]
}

pub fn reservoir_cargo(units: u16, low: u8) -> Vec<u8> {
    let mut v = units.to_le_bytes().to_vec();
    v.push(0);
    v.push(low);
    v
}

pub fn battery_v2_cargo(percent: u8, charging: u8) -> Vec<u8> {
    let mut v = vec![0, percent, charging];
    v.extend_from_slice(&[0; 8]);
    v
}

pub fn last_bolus_cargo(bolus_id: u16, delivered_mu: u32, delivery_status: u8, source: u8) -> Vec<u8> {
    let mut v = vec![0];
    v.extend_from_slice(&bolus_id.to_le_bytes());
    v.extend_from_slice(&600_000u32.to_le_bytes());
    v.extend_from_slice(&delivered_mu.to_le_bytes());
    v.push(delivery_status);
    v.push(source);
    v.push(0x01);
    v.extend_from_slice(&delivered_mu.to_le_bytes());
    v
}

pub fn history_status_cargo(entries: u32, first: u32, last: u32) -> Vec<u8> {
    let mut v = Vec::new();
    for n in [entries, first, last] {
        v.extend_from_slice(&n.to_le_bytes());
    }
    v
}

pub fn history_record(sequence: u32, event_type: u16, device_time: u32, payload: [u8; 16]) -> [u8; 26] {
    let mut r = [0u8; 26];
    r[..2].copy_from_slice(&event_type.to_le_bytes());
    r[2..6].copy_from_slice(&device_time.to_le_bytes());
    r[6..10].copy_from_slice(&sequence.to_le_bytes());
    r[10..].copy_from_slice(&payload);
    r
}

pub fn bolus_payload(bolus_id: u16, delivery_status: u8, source: u8, delivered_mu: u32) -> [u8; 16] {
    let mut p = [0u8; 16];
    p[..2].copy_from_slice(&bolus_id.to_le_bytes());
    p[2] = delivery_status;
    p[3] = 0x01;
    p[4] = source;
    p[12..16].copy_from_slice(&delivered_mu.to_le_bytes());
    p
}

pub fn bolus_record(sequence: u32, device_time: u32, delivered_mu: u32) -> [u8; 26] {
    history_record(
        sequence,
        EVENT_BOLUS_DELIVERY,
        device_time,
        bolus_payload(sequence as u16, 0, 1, delivered_mu),
    )
}

pub fn version_cargo(serial: &str, model: &str) -> Vec<u8> {
    let mut v = Vec::new();
    v.extend_from_slice(&105_900u32.to_le_bytes());
    v.extend_from_slice(&7u32.to_le_bytes());
    for s in ["7.6.0", serial, model, "B"] {
        v.extend_from_slice(&(s.len() as i32).to_le_bytes());
        v.extend_from_slice(s.as_bytes());
    }
    v
}

/// A pump with a plausible answer for every polled message.
pub fn full_script() -> PumpScript {
    PumpScript::default()
        .respond(MessageKind::ControlIqIob, iob_cargo(1500, 2750, 1))
        .respond(MessageKind::CurrentBasalStatus, basal_cargo(800, 800, 0))
        .respond(MessageKind::PumpSettings, Bytes::from_static(&[1, 70, 0, 0, 40, 0, 2]))
        .respond(MessageKind::CurrentEgv, cgm_cargo(600_000, 120, 1, 0))
        .respond(MessageKind::HomeScreenMirror, home_screen_cargo(4))
        .respond(MessageKind::LastBolusStatus, last_bolus_cargo(42, 2500, 0, 1))
        .respond(MessageKind::CurrentBatteryV2, battery_v2_cargo(80, 1))
        .respond(MessageKind::InsulinStatus, reservoir_cargo(120, 20))
        .respond(MessageKind::HistoryLogStatus, history_status_cargo(0, 0, 0))
        .respond(MessageKind::PumpVersion, version_cargo("1234567", "t:slim X2"))
        .respond(MessageKind::PumpFeatures, Bytes::from_static(&[0x0B, 0, 0, 0, 0, 0, 0, 0]))
}

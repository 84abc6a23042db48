//! History-log status, stream batches and delivery-event extraction.
//!
//! Stream cargo is `[count u8][stream id u8][records..]` with 26-byte
//! records. Pumps answering the older status query send 18-byte records in
//! the same envelope; such batches are recognised by size and skipped.

use crate::constants::{
    EVENT_BASAL_DELIVERY, EVENT_BOLUS_DELIVERY, HISTORY_PAYLOAD_SIZE, HISTORY_RECORD_SIZE, LEGACY_HISTORY_RECORD_SIZE,
};
use crate::safety::SafetyLimits;
use crate::status::bolus::{BolusDelivery, BolusEvent};
use crate::status::{local_offset, milliunits_to_units, pump_time_to_utc, read_raw};
use chrono::{DateTime, FixedOffset, Utc};
use num_enum::TryFromPrimitive;
use serde::Serialize;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

const STREAM_HEADER_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HistoryStatusRaw {
    pub entries: U32,
    pub first_sequence: U32,
    pub last_sequence: U32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryLogStatus {
    pub entries: u32,
    pub first_sequence: u32,
    pub last_sequence: u32,
}

impl From<HistoryStatusRaw> for HistoryLogStatus {
    fn from(raw: HistoryStatusRaw) -> Self {
        Self {
            entries: raw.entries.get(),
            first_sequence: raw.first_sequence.get(),
            last_sequence: raw.last_sequence.get(),
        }
    }
}

pub fn decode_history_status(cargo: &[u8]) -> Option<HistoryLogStatus> {
    read_raw::<HistoryStatusRaw>(cargo).map(HistoryLogStatus::from)
}

/// Response to a history-log request; the records follow on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryLogAck {
    pub status: u8,
    pub stream_id: u8,
}

pub fn decode_history_ack(cargo: &[u8]) -> Option<HistoryLogAck> {
    match cargo {
        [status, stream_id, ..] => Some(HistoryLogAck {
            status: *status,
            stream_id: *stream_id,
        }),
        _ => None,
    }
}

/// Request cargo: `[start sequence u32][count u8]`.
pub fn history_request_cargo(start_sequence: u32, count: u8) -> [u8; 5] {
    let mut cargo = [0u8; 5];
    cargo[..4].copy_from_slice(&start_sequence.to_le_bytes());
    cargo[4] = count;
    cargo
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HistoryRecordRaw {
    pub event_type: U16,
    pub device_time: U32, // seconds since pump epoch
    pub sequence: U32,
    pub payload: [u8; HISTORY_PAYLOAD_SIZE],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryLogRecord {
    pub sequence: u32,
    pub event_type: u16,
    pub device_time: u32,
    pub payload: [u8; HISTORY_PAYLOAD_SIZE],
}

impl From<HistoryRecordRaw> for HistoryLogRecord {
    fn from(raw: HistoryRecordRaw) -> Self {
        Self {
            sequence: raw.sequence.get(),
            event_type: raw.event_type.get(),
            device_time: raw.device_time.get(),
            payload: raw.payload,
        }
    }
}

/// Decode one stream batch. Malformed and legacy batches yield no records.
pub fn decode_history_stream(cargo: &[u8]) -> Vec<HistoryLogRecord> {
    if cargo.len() < STREAM_HEADER_SIZE {
        return Vec::new();
    }
    let count = cargo[0] as usize;
    let area = &cargo[STREAM_HEADER_SIZE..];

    if area.len() != count * HISTORY_RECORD_SIZE {
        if area.len() == count * LEGACY_HISTORY_RECORD_SIZE {
            tracing::debug!(count, "skipping legacy 18-byte history batch");
        } else {
            tracing::debug!(count, bytes = area.len(), "history batch size mismatch");
        }
        return Vec::new();
    }

    area.chunks_exact(HISTORY_RECORD_SIZE)
        .filter_map(read_raw::<HistoryRecordRaw>)
        .map(HistoryLogRecord::from)
        .collect()
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BolusPayloadRaw {
    pub bolus_id: U16,
    pub delivery_status: u8, // 0 completed, 1 started
    pub type_bits: u8,
    pub source: u8,
    pub reserved: u8,
    pub requested_now: U16,   // milliunits
    pub correction: U16,      // milliunits
    pub requested_later: U16, // milliunits
    pub delivered_total: U32, // milliunits
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BasalPayloadRaw {
    pub source: u8,
    pub reserved: [u8; 3],
    pub profile_rate: U16,   // milliunits/hour
    pub commanded_rate: U16, // milliunits/hour
    pub algorithm_rate: U16, // milliunits/hour
    pub temp_rate: U16,      // milliunits/hour
    pub reserved2: [u8; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, TryFromPrimitive)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BasalSource {
    Suspended = 0,
    Profile = 1,
    TempRate = 2,
    Algorithm = 3,
}

impl BasalSource {
    /// Suspension is an algorithm decision as far as delivery is concerned.
    pub fn is_automated(self) -> bool {
        matches!(self, BasalSource::Suspended | BasalSource::Algorithm)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasalEvent {
    pub source: BasalSource,
    pub automated: bool,
    pub rate_units_per_hour: f32,
    pub profile_rate_units_per_hour: f32,
    pub algorithm_rate_units_per_hour: f32,
    pub temp_rate_units_per_hour: f32,
    pub sequence: u32,
    pub device_time: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HistoryEvent {
    Bolus(BolusEvent),
    Basal(BasalEvent),
}

impl HistoryEvent {
    pub fn device_time(&self) -> u32 {
        match self {
            HistoryEvent::Bolus(e) => e.device_time,
            HistoryEvent::Basal(e) => e.device_time,
        }
    }
}

fn bolus_event(record: &HistoryLogRecord, limits: &SafetyLimits, offset: FixedOffset) -> Option<BolusEvent> {
    let raw = read_raw::<BolusPayloadRaw>(&record.payload)?;
    BolusDelivery {
        bolus_id: raw.bolus_id.get(),
        delivery_status: raw.delivery_status,
        type_bits: raw.type_bits,
        source: raw.source,
        delivered_milliunits: raw.delivered_total.get(),
        device_time: record.device_time,
    }
    .into_event(limits, offset)
}

fn basal_event(record: &HistoryLogRecord, limits: &SafetyLimits, offset: FixedOffset) -> Option<BasalEvent> {
    let raw = read_raw::<BasalPayloadRaw>(&record.payload)?;
    let Ok(source) = BasalSource::try_from(raw.source) else {
        tracing::debug!(sequence = record.sequence, source = raw.source, "unknown basal source");
        return None;
    };
    let commanded = raw.commanded_rate.get() as u32;
    if !limits.check_basal(commanded) {
        tracing::warn!(
            sequence = record.sequence,
            rate_mu_per_hour = commanded,
            "basal rate outside safety limits, dropped"
        );
        return None;
    }
    Some(BasalEvent {
        source,
        automated: source.is_automated(),
        rate_units_per_hour: milliunits_to_units(commanded),
        profile_rate_units_per_hour: milliunits_to_units(raw.profile_rate.get() as u32),
        algorithm_rate_units_per_hour: milliunits_to_units(raw.algorithm_rate.get() as u32),
        temp_rate_units_per_hour: milliunits_to_units(raw.temp_rate.get() as u32),
        sequence: record.sequence,
        device_time: record.device_time,
        timestamp: pump_time_to_utc(record.device_time, offset)?,
    })
}

/// Bolus and basal deliveries in device-time order. Every other event type
/// is ignored.
pub fn extract_events(records: &[HistoryLogRecord], limits: &SafetyLimits) -> Vec<HistoryEvent> {
    extract_events_with_offset(records, limits, local_offset())
}

pub fn extract_events_with_offset(
    records: &[HistoryLogRecord],
    limits: &SafetyLimits,
    offset: FixedOffset,
) -> Vec<HistoryEvent> {
    let mut events: Vec<HistoryEvent> = records
        .iter()
        .filter_map(|record| match record.event_type {
            EVENT_BOLUS_DELIVERY => bolus_event(record, limits, offset).map(HistoryEvent::Bolus),
            EVENT_BASAL_DELIVERY => basal_event(record, limits, offset).map(HistoryEvent::Basal),
            _ => None,
        })
        .collect();
    events.sort_by_key(HistoryEvent::device_time);
    events
}

use super::{local_offset, milliunits_to_units, pump_time_to_utc, read_raw};
use crate::safety::SafetyLimits;
use chrono::{DateTime, FixedOffset, Utc};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::Serialize;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromPrimitive, IntoPrimitive)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum BolusSource {
    QuickBolus = 0,
    Gui = 1,
    Mobile = 2,
    Algorithm = 7,
    #[num_enum(catch_all)]
    Other(u8),
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusTypeBits {
    pub food: bool,
    pub correction: bool,
    pub extended: bool,
    pub food2: bool,
    #[skip]
    reserved: B4,
}

const DELIVERY_COMPLETED: u8 = 0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BolusEvent {
    pub bolus_id: u16,
    pub units: f32,
    pub automated: bool,
    pub correction: bool,
    pub source: BolusSource,
    /// Seconds since the pump epoch, as reported.
    pub device_time: u32,
    pub timestamp: DateTime<Utc>,
}

/// Fields both the history log and the last-bolus query report for a bolus.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BolusDelivery {
    pub bolus_id: u16,
    pub delivery_status: u8,
    pub type_bits: u8,
    pub source: u8,
    pub delivered_milliunits: u32,
    pub device_time: u32,
}

impl BolusDelivery {
    /// Completed deliveries within the bolus cap become events. A bolus that
    /// has only started is dropped whatever its amount.
    pub fn into_event(self, limits: &SafetyLimits, offset: FixedOffset) -> Option<BolusEvent> {
        if self.delivery_status != DELIVERY_COMPLETED {
            tracing::debug!(bolus_id = self.bolus_id, status = self.delivery_status, "bolus not completed");
            return None;
        }
        if !limits.check_bolus(self.delivered_milliunits) {
            tracing::warn!(
                bolus_id = self.bolus_id,
                delivered_mu = self.delivered_milliunits,
                "bolus outside safety limits, dropped"
            );
            return None;
        }
        let source = BolusSource::from(self.source);
        let bits = BolusTypeBits::from_bytes([self.type_bits]);
        Some(BolusEvent {
            bolus_id: self.bolus_id,
            units: milliunits_to_units(self.delivered_milliunits),
            automated: source == BolusSource::Algorithm,
            correction: bits.correction(),
            source,
            device_time: self.device_time,
            timestamp: pump_time_to_utc(self.device_time, offset)?,
        })
    }
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct LastBolusRaw {
    pub status: u8,
    pub bolus_id: U16,
    pub timestamp: U32, // seconds since pump epoch
    pub delivered: U32, // milliunits
    pub delivery_status: u8,
    pub source: u8,
    pub type_bits: u8,
    pub requested: U32, // milliunits
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastBolusStatus {
    pub status: u8,
    pub bolus_id: u16,
    pub device_time: u32,
    pub delivered_units: f32,
    pub requested_units: f32,
    pub delivery_status: u8,
    pub source: BolusSource,
    pub type_bits: u8,
}

impl From<LastBolusRaw> for LastBolusStatus {
    fn from(raw: LastBolusRaw) -> Self {
        Self {
            status: raw.status,
            bolus_id: raw.bolus_id.get(),
            device_time: raw.timestamp.get(),
            delivered_units: milliunits_to_units(raw.delivered.get()),
            requested_units: milliunits_to_units(raw.requested.get()),
            delivery_status: raw.delivery_status,
            source: BolusSource::from(raw.source),
            type_bits: raw.type_bits,
        }
    }
}

impl From<LastBolusRaw> for BolusDelivery {
    fn from(raw: LastBolusRaw) -> Self {
        Self {
            bolus_id: raw.bolus_id.get(),
            delivery_status: raw.delivery_status,
            type_bits: raw.type_bits,
            source: raw.source,
            delivered_milliunits: raw.delivered.get(),
            device_time: raw.timestamp.get(),
        }
    }
}

/// Unfiltered view of the last-bolus response.
pub fn decode_last_bolus_status(cargo: &[u8]) -> Option<LastBolusStatus> {
    read_raw::<LastBolusRaw>(cargo).map(LastBolusStatus::from)
}

/// The last bolus as an event, under the same rules as history records.
pub fn decode_last_bolus(cargo: &[u8], limits: &SafetyLimits) -> Option<BolusEvent> {
    let raw = read_raw::<LastBolusRaw>(cargo)?;
    BolusDelivery::from(raw).into_event(limits, local_offset())
}

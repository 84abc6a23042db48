use super::{milliunits_to_units, read_raw};
use chrono::{DateTime, Utc};
use serde::Serialize;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct IobRaw {
    pub mode_a_iob: U32,     // milliunits
    pub time_remaining: U32, // seconds
    pub total_iob: U32,      // milliunits
    pub mode_b_iob: U32,     // milliunits
    pub mode: u8,
}

/// Which of the two IoB figures the pump considers authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IobSource {
    ModeA,
    ModeB,
}

impl IobSource {
    /// Values other than 1 fall back to mode A.
    pub fn from_mode_byte(mode: u8) -> Self {
        match mode {
            1 => IobSource::ModeB,
            _ => IobSource::ModeA,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IobReading {
    pub units: f32,
    pub total_units: f32,
    pub time_remaining_secs: u32,
    pub source: IobSource,
    pub timestamp: DateTime<Utc>,
}

impl From<IobRaw> for IobReading {
    fn from(raw: IobRaw) -> Self {
        let source = IobSource::from_mode_byte(raw.mode);
        let milliunits = match source {
            IobSource::ModeA => raw.mode_a_iob.get(),
            IobSource::ModeB => raw.mode_b_iob.get(),
        };
        Self {
            units: milliunits_to_units(milliunits),
            total_units: milliunits_to_units(raw.total_iob.get()),
            time_remaining_secs: raw.time_remaining.get(),
            source,
            timestamp: Utc::now(),
        }
    }
}

pub fn decode_iob(cargo: &[u8]) -> Option<IobReading> {
    read_raw::<IobRaw>(cargo).map(IobReading::from)
}

use super::read_raw;
use serde::Serialize;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct InsulinStatusRaw {
    pub units: U16, // whole units, not milliunits
    pub is_estimate: u8,
    pub low_threshold: u8, // whole units
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReservoirReading {
    pub units: u16,
    pub is_estimate: bool,
    pub low_threshold_units: u8,
}

impl ReservoirReading {
    pub fn is_low(&self) -> bool {
        self.units <= self.low_threshold_units as u16
    }
}

impl From<InsulinStatusRaw> for ReservoirReading {
    fn from(raw: InsulinStatusRaw) -> Self {
        Self {
            units: raw.units.get(),
            is_estimate: raw.is_estimate != 0,
            low_threshold_units: raw.low_threshold,
        }
    }
}

pub fn decode_reservoir(cargo: &[u8]) -> Option<ReservoirReading> {
    read_raw::<InsulinStatusRaw>(cargo).map(ReservoirReading::from)
}

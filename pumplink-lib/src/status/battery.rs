//! Battery status comes in two incompatible layouts, chosen by opcode.
//! The older one has no charging byte at all.

use super::read_raw;
use serde::Serialize;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BatteryV1Raw {
    pub abc: u8, // app battery charge
    pub ibc: u8, // percentage shown on the pump
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BatteryV2Raw {
    pub abc: u8,
    pub ibc: u8,
    pub charging: u8,
    pub reserved: [U16; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryReading {
    pub percent: u8,
    pub charging: bool,
}

impl From<BatteryV1Raw> for BatteryReading {
    fn from(raw: BatteryV1Raw) -> Self {
        Self {
            percent: raw.ibc,
            charging: false,
        }
    }
}

impl From<BatteryV2Raw> for BatteryReading {
    fn from(raw: BatteryV2Raw) -> Self {
        Self {
            percent: raw.ibc,
            charging: raw.charging == 1,
        }
    }
}

pub fn decode_battery_v1(cargo: &[u8]) -> Option<BatteryReading> {
    read_raw::<BatteryV1Raw>(cargo).map(BatteryReading::from)
}

pub fn decode_battery_v2(cargo: &[u8]) -> Option<BatteryReading> {
    read_raw::<BatteryV2Raw>(cargo).map(BatteryReading::from)
}

use super::settings::{PumpSettings, UserMode};
use super::{milliunits_to_units, read_raw};
use crate::safety::SafetyLimits;
use chrono::{DateTime, Utc};
use modular_bitfield::prelude::*;
use serde::Serialize;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BasalRaw {
    pub profile_rate: U32, // milliunits/hour
    pub current_rate: U32, // milliunits/hour
    pub modified: u8,
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BasalModifiedFlags {
    pub suspended: bool,
    pub algorithm: bool,
    #[skip]
    reserved: B6,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BasalReading {
    pub rate_units_per_hour: f32,
    pub profile_rate_units_per_hour: f32,
    pub automated: bool,
    pub suspended: bool,
    /// Only known once merged with pump settings.
    pub mode: Option<UserMode>,
    pub timestamp: DateTime<Utc>,
}

impl BasalReading {
    pub fn with_mode(self, settings: &PumpSettings) -> Self {
        Self {
            mode: Some(settings.user_mode),
            ..self
        }
    }
}

pub fn decode_basal(cargo: &[u8], limits: &SafetyLimits) -> Option<BasalReading> {
    let raw = read_raw::<BasalRaw>(cargo)?;
    let current = raw.current_rate.get();
    if !limits.check_basal(current) {
        tracing::warn!(rate_mu_per_hour = current, "basal rate outside safety limits, dropped");
        return None;
    }
    let flags = BasalModifiedFlags::from_bytes([raw.modified]);
    Some(BasalReading {
        rate_units_per_hour: milliunits_to_units(current),
        profile_rate_units_per_hour: milliunits_to_units(raw.profile_rate.get()),
        // any modification bit, including unknown ones, means the pump is not on its profile
        automated: raw.modified != 0,
        suspended: flags.suspended(),
        mode: None,
        timestamp: Utc::now(),
    })
}

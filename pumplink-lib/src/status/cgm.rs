use super::home::{HomeScreenMirror, TrendArrow};
use super::{local_offset, pump_time_to_utc, read_raw};
use crate::constants::CGM_MAX_PLAUSIBLE_MG_DL;
use crate::safety::SafetyLimits;
use chrono::{DateTime, FixedOffset, Utc};
use num_enum::TryFromPrimitive;
use serde::Serialize;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct CgmRaw {
    pub timestamp: U32, // seconds since pump epoch, pump wall clock
    pub glucose: U16,   // mg/dL
    pub status: u8,
    pub trend_rate: i8,
}

/// Statuses that carry a usable glucose value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, TryFromPrimitive)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CgmStatus {
    Valid = 1,
    Low = 2,
    High = 3,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CgmReading {
    pub glucose_mg_dl: u16,
    pub status: CgmStatus,
    /// Only known once merged with the home-screen mirror.
    pub trend: Option<TrendArrow>,
    pub trend_rate: i8,
    pub timestamp: DateTime<Utc>,
}

impl CgmReading {
    pub fn with_trend(self, mirror: &HomeScreenMirror) -> Self {
        Self {
            trend: mirror.trend,
            ..self
        }
    }
}

/// Decode a CGM reading, interpreting the pump clock in the host's current
/// time zone.
pub fn decode_cgm(cargo: &[u8], limits: &SafetyLimits) -> Option<CgmReading> {
    decode_cgm_with_offset(cargo, limits, local_offset())
}

pub fn decode_cgm_with_offset(cargo: &[u8], limits: &SafetyLimits, offset: FixedOffset) -> Option<CgmReading> {
    let raw = read_raw::<CgmRaw>(cargo)?;
    let status = CgmStatus::try_from(raw.status).ok()?;
    let glucose = raw.glucose.get();
    if glucose == 0 || glucose > CGM_MAX_PLAUSIBLE_MG_DL {
        tracing::debug!(glucose, "implausible CGM value");
        return None;
    }
    if !limits.check_glucose(glucose) {
        tracing::warn!(glucose, "glucose outside safety limits, dropped");
        return None;
    }
    Some(CgmReading {
        glucose_mg_dl: glucose,
        status,
        trend: None,
        trend_rate: raw.trend_rate,
        timestamp: pump_time_to_utc(raw.timestamp.get(), offset)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cargo(timestamp: u32, glucose: u16, status: u8, rate: i8) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&timestamp.to_le_bytes());
        v.extend_from_slice(&glucose.to_le_bytes());
        v.push(status);
        v.push(rate as u8);
        v
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_glucose_bounds() {
        let limits = SafetyLimits::default();
        assert!(decode_cgm_with_offset(&cargo(0, 0, 1, 0), &limits, utc()).is_none());
        assert!(decode_cgm_with_offset(&cargo(0, 501, 1, 0), &limits, utc()).is_none());
        let r = decode_cgm_with_offset(&cargo(0, 500, 3, 0), &limits, utc()).unwrap();
        assert_eq!(r.glucose_mg_dl, 500);
        assert_eq!(r.status, CgmStatus::High);
    }

    #[test]
    fn test_status_filter() {
        let limits = SafetyLimits::default();
        for status in [0u8, 4, 5, 0xFF] {
            assert!(decode_cgm_with_offset(&cargo(0, 120, status, 0), &limits, utc()).is_none());
        }
        for status in [1u8, 2, 3] {
            assert!(decode_cgm_with_offset(&cargo(0, 120, status, 0), &limits, utc()).is_some());
        }
    }

    #[test]
    fn test_configured_limits_apply() {
        let limits = SafetyLimits {
            glucose_min: 40,
            glucose_max: 400,
            ..SafetyLimits::default()
        };
        assert!(decode_cgm_with_offset(&cargo(0, 39, 2, 0), &limits, utc()).is_none());
        assert!(decode_cgm_with_offset(&cargo(0, 401, 3, 0), &limits, utc()).is_none());
        assert!(decode_cgm_with_offset(&cargo(0, 40, 2, 0), &limits, utc()).is_some());
    }

    #[test]
    fn test_timestamp_local_time() {
        let limits = SafetyLimits::default();
        // 2024-01-01T12:00:00 pump wall clock, host at UTC-5
        let secs = (1_704_110_400 - 1_199_145_600) as u32;
        let minus_five = FixedOffset::west_opt(5 * 3600).unwrap();
        let r = decode_cgm_with_offset(&cargo(secs, 110, 1, -2), &limits, minus_five).unwrap();
        assert_eq!(r.timestamp.to_rfc3339(), "2024-01-01T17:00:00+00:00");
        assert_eq!(r.trend_rate, -2);
        assert_eq!(r.trend, None);
    }

    #[test]
    fn test_with_trend() {
        let limits = SafetyLimits::default();
        let r = decode_cgm_with_offset(&cargo(0, 110, 1, 0), &limits, utc()).unwrap();
        let mirror = super::super::home::decode_home_screen(&[2, 0, 0, 0, 0, 0, 0, 0, 1]).unwrap();
        assert_eq!(r.with_trend(&mirror).trend, Some(TrendArrow::SingleUp));
    }

    #[test]
    fn test_short_cargo() {
        assert!(decode_cgm(&cargo(0, 120, 1, 0)[..7], &SafetyLimits::default()).is_none());
    }
}

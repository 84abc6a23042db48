use super::read_raw;
use bytes::Buf;
use modular_bitfield::prelude::*;
use serde::Serialize;
use zerocopy::byteorder::little_endian::U64;

/// Fixed part of the version response: two software revisions and four
/// empty string length prefixes.
const PUMP_VERSION_MIN_SIZE: usize = 8 + 4 * 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpVersion {
    pub arm_sw_version: u32,
    pub msp_sw_version: u32,
    pub firmware_version: String,
    pub serial: String,
    pub model: String,
    pub board_revision: String,
}

/// `[len u32 LE][utf-8 bytes]`. A length that is negative as i32 or runs
/// past the cargo is a decode failure.
fn read_prefixed_string(buf: &mut &[u8]) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_i32_le();
    if len < 0 || len as usize > buf.remaining() {
        return None;
    }
    let len = len as usize;
    let text = std::str::from_utf8(&buf[..len]).ok()?.to_string();
    buf.advance(len);
    Some(text)
}

pub fn decode_pump_version(cargo: &[u8]) -> Option<PumpVersion> {
    if cargo.len() < PUMP_VERSION_MIN_SIZE {
        return None;
    }
    let mut buf = cargo;
    let arm_sw_version = buf.get_u32_le();
    let msp_sw_version = buf.get_u32_le();
    Some(PumpVersion {
        arm_sw_version,
        msp_sw_version,
        firmware_version: read_prefixed_string(&mut buf)?,
        serial: read_prefixed_string(&mut buf)?,
        model: read_prefixed_string(&mut buf)?,
        board_revision: read_prefixed_string(&mut buf)?,
    })
}

#[bitfield(bytes = 8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureBits {
    pub dexcom_g5: bool,
    pub dexcom_g6: bool,
    pub basal_iq: bool,
    pub control_iq: bool,
    pub libre2: bool,
    #[skip]
    reserved: B59,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpFeatures {
    pub bitmap: u64,
    pub dexcom_g5: bool,
    pub dexcom_g6: bool,
    pub basal_iq: bool,
    pub control_iq: bool,
    pub libre2: bool,
}

impl From<u64> for PumpFeatures {
    fn from(bitmap: u64) -> Self {
        let bits = FeatureBits::from_bytes(bitmap.to_le_bytes());
        Self {
            bitmap,
            dexcom_g5: bits.dexcom_g5(),
            dexcom_g6: bits.dexcom_g6(),
            basal_iq: bits.basal_iq(),
            control_iq: bits.control_iq(),
            libre2: bits.libre2(),
        }
    }
}

pub fn decode_pump_features(cargo: &[u8]) -> Option<PumpFeatures> {
    read_raw::<U64>(cargo).map(|bitmap| PumpFeatures::from(bitmap.get()))
}

/// What the slow poll reports about the pump itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpHardwareInfo {
    pub serial: String,
    pub model: String,
    pub firmware_version: String,
    pub board_revision: String,
    pub arm_sw_version: u32,
    pub msp_sw_version: u32,
    pub features: Option<PumpFeatures>,
}

impl From<PumpVersion> for PumpHardwareInfo {
    fn from(version: PumpVersion) -> Self {
        Self {
            serial: version.serial,
            model: version.model,
            firmware_version: version.firmware_version,
            board_revision: version.board_revision,
            arm_sw_version: version.arm_sw_version,
            msp_sw_version: version.msp_sw_version,
            features: None,
        }
    }
}

impl PumpHardwareInfo {
    pub fn with_features(self, features: PumpFeatures) -> Self {
        Self {
            features: Some(features),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(v: &mut Vec<u8>, s: &str) {
        v.extend_from_slice(&(s.len() as u32).to_le_bytes());
        v.extend_from_slice(s.as_bytes());
    }

    fn version_cargo() -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&3_547_127u32.to_le_bytes());
        v.extend_from_slice(&3_547_128u32.to_le_bytes());
        push_str(&mut v, "7.7.1");
        push_str(&mut v, "1234567");
        push_str(&mut v, "t:slim X2");
        push_str(&mut v, "");
        v
    }

    #[test]
    fn test_decode_version() {
        let v = decode_pump_version(&version_cargo()).unwrap();
        assert_eq!(v.arm_sw_version, 3_547_127);
        assert_eq!(v.firmware_version, "7.7.1");
        assert_eq!(v.serial, "1234567");
        assert_eq!(v.model, "t:slim X2");
        assert_eq!(v.board_revision, "");
    }

    #[test]
    fn test_string_length_past_end() {
        let mut cargo = version_cargo();
        // firmware string claims 200 bytes
        cargo[8..12].copy_from_slice(&200u32.to_le_bytes());
        assert!(decode_pump_version(&cargo).is_none());
    }

    #[test]
    fn test_negative_string_length() {
        let mut cargo = version_cargo();
        cargo[8..12].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(decode_pump_version(&cargo).is_none());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut cargo = Vec::new();
        cargo.extend_from_slice(&[0u8; 8]);
        cargo.extend_from_slice(&2u32.to_le_bytes());
        cargo.extend_from_slice(&[0xFF, 0xFE]);
        cargo.extend_from_slice(&[0u8; 12]);
        assert!(decode_pump_version(&cargo).is_none());
    }

    #[test]
    fn test_truncated_version() {
        assert!(decode_pump_version(&version_cargo()[..20]).is_none());
        let cargo = version_cargo();
        assert!(decode_pump_version(&cargo[..cargo.len() - 1]).is_none());
    }

    #[test]
    fn test_features() {
        let f = decode_pump_features(&0b01010u64.to_le_bytes()).unwrap();
        assert!(!f.dexcom_g5);
        assert!(f.dexcom_g6);
        assert!(!f.basal_iq);
        assert!(f.control_iq);
        assert!(!f.libre2);
        assert_eq!(f.bitmap, 0b01010);
        assert!(decode_pump_features(&[0u8; 7]).is_none());
    }

    #[test]
    fn test_hardware_info_merge() {
        let info = PumpHardwareInfo::from(decode_pump_version(&version_cargo()).unwrap());
        assert_eq!(info.features, None);
        let info = info.with_features(PumpFeatures::from(0b10000));
        assert!(info.features.unwrap().libre2);
    }
}

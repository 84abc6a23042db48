use super::{milliunits_to_units, read_raw};
use num_enum::TryFromPrimitive;
use serde::Serialize;
use strum_macros::Display;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Control-IQ activity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, TryFromPrimitive)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum UserMode {
    Standard = 0,
    Sleep = 1,
    Exercise = 2,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PumpSettingsRaw {
    pub closed_loop: u8,
    pub weight: U16,
    pub weight_unit: u8, // 0 lbs, 1 kg
    pub total_daily_insulin: u8,
    pub user_mode: u8,
    pub control_state: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpSettings {
    pub closed_loop: bool,
    pub weight: u16,
    pub weight_unit: u8,
    pub total_daily_insulin: u8,
    pub user_mode: UserMode,
    pub control_state: u8,
}

/// An unknown user mode rejects the whole message.
pub fn decode_pump_settings(cargo: &[u8]) -> Option<PumpSettings> {
    let raw = read_raw::<PumpSettingsRaw>(cargo)?;
    Some(PumpSettings {
        closed_loop: raw.closed_loop != 0,
        weight: raw.weight.get(),
        weight_unit: raw.weight_unit,
        total_daily_insulin: raw.total_daily_insulin,
        user_mode: UserMode::try_from(raw.user_mode).ok()?,
        control_state: raw.control_state,
    })
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct BolusCalcRaw {
    pub unacked: u8,
    pub correction_factor: U16, // mg/dL per unit
    pub carb_ratio: U32,        // grams per unit x1000
    pub target_bg: U16,         // mg/dL
    pub iob: U32,               // milliunits
    pub max_bolus: U16,         // milliunits
    pub current_bg: U16,        // mg/dL, 0 when unknown
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BolusCalcSnapshot {
    pub unacked_alerts: bool,
    pub correction_factor: u16,
    pub carb_ratio: f32,
    pub target_bg: u16,
    pub iob_units: f32,
    pub max_bolus_units: f32,
    pub current_bg: Option<u16>,
}

impl From<BolusCalcRaw> for BolusCalcSnapshot {
    fn from(raw: BolusCalcRaw) -> Self {
        let current_bg = raw.current_bg.get();
        Self {
            unacked_alerts: raw.unacked != 0,
            correction_factor: raw.correction_factor.get(),
            carb_ratio: raw.carb_ratio.get() as f32 / 1000.0,
            target_bg: raw.target_bg.get(),
            iob_units: milliunits_to_units(raw.iob.get()),
            max_bolus_units: milliunits_to_units(raw.max_bolus.get() as u32),
            current_bg: (current_bg != 0).then_some(current_bg),
        }
    }
}

pub fn decode_bolus_calc(cargo: &[u8]) -> Option<BolusCalcSnapshot> {
    read_raw::<BolusCalcRaw>(cargo).map(BolusCalcSnapshot::from)
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PumpGlobalsRaw {
    pub quick_bolus_enabled: u8,
    pub quick_bolus_increment_units: U16, // milliunits
    pub quick_bolus_increment_carbs: U16, // grams
    pub quick_bolus_entry_type: u8,
    pub quick_bolus_status: u8,
    pub button_annunciation: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PumpGlobals {
    pub quick_bolus_enabled: bool,
    pub quick_bolus_increment_units: f32,
    pub quick_bolus_increment_carbs: u16,
    pub quick_bolus_entry_type: u8,
    pub quick_bolus_status: u8,
    pub button_annunciation: u8,
}

impl From<PumpGlobalsRaw> for PumpGlobals {
    fn from(raw: PumpGlobalsRaw) -> Self {
        Self {
            quick_bolus_enabled: raw.quick_bolus_enabled != 0,
            quick_bolus_increment_units: milliunits_to_units(raw.quick_bolus_increment_units.get() as u32),
            quick_bolus_increment_carbs: raw.quick_bolus_increment_carbs.get(),
            quick_bolus_entry_type: raw.quick_bolus_entry_type,
            quick_bolus_status: raw.quick_bolus_status,
            button_annunciation: raw.button_annunciation,
        }
    }
}

pub fn decode_pump_globals(cargo: &[u8]) -> Option<PumpGlobals> {
    read_raw::<PumpGlobalsRaw>(cargo).map(PumpGlobals::from)
}

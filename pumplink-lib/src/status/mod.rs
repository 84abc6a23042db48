//! Decoders for current-status responses.
//!
//! Each decoder takes the cargo of one response and returns `None` when the
//! cargo is too short or carries values that cannot be trusted. Fixed layouts
//! are read through `zerocopy` raw structs and converted with `From`, the
//! same way every response type is handled.

pub mod basal;
pub mod battery;
pub mod bolus;
pub mod cgm;
pub mod home;
pub mod insulin;
pub mod iob;
pub mod settings;
pub mod version;

use crate::constants::{MILLIUNITS_PER_UNIT, PUMP_EPOCH_UNIX_SECS};
use crate::history::{BasalEvent, HistoryLogRecord, HistoryLogStatus};
use crate::message::MessageKind;
use crate::safety::SafetyLimits;
use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use serde::Serialize;
use zerocopy::FromBytes;

pub use basal::{BasalReading, decode_basal};
pub use battery::{BatteryReading, decode_battery_v1, decode_battery_v2};
pub use bolus::{BolusEvent, BolusSource, LastBolusStatus, decode_last_bolus};
pub use cgm::{CgmReading, CgmStatus, decode_cgm, decode_cgm_with_offset};
pub use home::{HomeScreenMirror, TrendArrow, decode_home_screen};
pub use insulin::{ReservoirReading, decode_reservoir};
pub use iob::{IobReading, decode_iob};
pub use settings::{
    BolusCalcSnapshot, PumpGlobals, PumpSettings, UserMode, decode_bolus_calc, decode_pump_globals,
    decode_pump_settings,
};
pub use version::{PumpFeatures, PumpHardwareInfo, PumpVersion, decode_pump_features, decode_pump_version};

/// A decoded value handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reading {
    Iob(IobReading),
    Basal(BasalReading),
    Cgm(CgmReading),
    Bolus(BolusEvent),
    BasalDelivery(BasalEvent),
    Reservoir(ReservoirReading),
    Battery(BatteryReading),
    HardwareInfo(PumpHardwareInfo),
    HistoryRecord(HistoryLogRecord),
}

impl Reading {
    pub fn name(&self) -> &'static str {
        match self {
            Reading::Iob(_) => "iob",
            Reading::Basal(_) => "basal",
            Reading::Cgm(_) => "cgm",
            Reading::Bolus(_) => "bolus",
            Reading::BasalDelivery(_) => "basal_delivery",
            Reading::Reservoir(_) => "reservoir",
            Reading::Battery(_) => "battery",
            Reading::HardwareInfo(_) => "hardware_info",
            Reading::HistoryRecord(_) => "history_record",
        }
    }
}

/// Any decoded response, for offline inspection of captured cargo.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Decoded {
    Reading(Reading),
    HomeScreen(HomeScreenMirror),
    Settings(PumpSettings),
    BolusCalc(BolusCalcSnapshot),
    Globals(PumpGlobals),
    Features(PumpFeatures),
    Version(PumpVersion),
    LastBolus(LastBolusStatus),
    HistoryStatus(HistoryLogStatus),
}

/// Decode the cargo of a response by message kind.
///
/// Authorization messages and the history stream are not status responses
/// and always yield `None`.
pub fn decode_response(kind: MessageKind, cargo: &[u8], limits: &SafetyLimits) -> Option<Decoded> {
    let decoded = match kind {
        MessageKind::ControlIqIob => Decoded::Reading(Reading::Iob(decode_iob(cargo)?)),
        MessageKind::CurrentBasalStatus => Decoded::Reading(Reading::Basal(decode_basal(cargo, limits)?)),
        MessageKind::CurrentEgv => Decoded::Reading(Reading::Cgm(decode_cgm(cargo, limits)?)),
        MessageKind::InsulinStatus => Decoded::Reading(Reading::Reservoir(decode_reservoir(cargo)?)),
        MessageKind::CurrentBatteryV1 => Decoded::Reading(Reading::Battery(decode_battery_v1(cargo)?)),
        MessageKind::CurrentBatteryV2 => Decoded::Reading(Reading::Battery(decode_battery_v2(cargo)?)),
        MessageKind::HomeScreenMirror => Decoded::HomeScreen(decode_home_screen(cargo)?),
        MessageKind::PumpSettings => Decoded::Settings(decode_pump_settings(cargo)?),
        MessageKind::BolusCalcSnapshot => Decoded::BolusCalc(decode_bolus_calc(cargo)?),
        MessageKind::PumpGlobals => Decoded::Globals(decode_pump_globals(cargo)?),
        MessageKind::PumpFeatures => Decoded::Features(decode_pump_features(cargo)?),
        MessageKind::PumpVersion => Decoded::Version(decode_pump_version(cargo)?),
        MessageKind::LastBolusStatus => Decoded::LastBolus(bolus::decode_last_bolus_status(cargo)?),
        MessageKind::HistoryLogStatus => Decoded::HistoryStatus(crate::history::decode_history_status(cargo)?),
        _ => return None,
    };
    Some(decoded)
}

pub(crate) fn read_raw<T: FromBytes>(cargo: &[u8]) -> Option<T> {
    T::read_from_prefix(cargo).ok().map(|(raw, _)| raw)
}

pub fn milliunits_to_units(milliunits: u32) -> f32 {
    milliunits as f32 / MILLIUNITS_PER_UNIT
}

/// The host's current UTC offset, used to interpret pump wall-clock times.
pub fn local_offset() -> FixedOffset {
    *Local::now().offset()
}

/// Seconds since the pump epoch, read as wall-clock time at `offset`.
pub fn pump_time_to_utc(seconds: u32, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let wall = DateTime::from_timestamp(PUMP_EPOCH_UNIX_SECS + seconds as i64, 0)?.naive_utc();
    offset
        .from_local_datetime(&wall)
        .single()
        .map(|local| local.with_timezone(&Utc))
}

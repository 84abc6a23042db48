use super::read_raw;
use num_enum::TryFromPrimitive;
use serde::Serialize;
use strum_macros::Display;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HomeScreenRaw {
    pub cgm_trend_icon: u8,
    pub cgm_alert_icon: u8,
    pub status_icon0: u8,
    pub status_icon1: u8,
    pub bolus_status_icon: u8,
    pub basal_status_icon: u8,
    pub control_state_icon: u8,
    pub reservoir_icon: u8,
    pub cgm_display_data: u8,
}

/// CGM trend as drawn on the pump's home screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, TryFromPrimitive)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TrendArrow {
    DoubleUp = 1,
    SingleUp = 2,
    FortyFiveUp = 3,
    Flat = 4,
    FortyFiveDown = 5,
    SingleDown = 6,
    DoubleDown = 7,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HomeScreenMirror {
    /// `None` when the icon is blank or not one we know.
    pub trend: Option<TrendArrow>,
    pub cgm_alert_icon: u8,
    pub status_icons: [u8; 2],
    pub bolus_status_icon: u8,
    pub basal_status_icon: u8,
    pub control_state_icon: u8,
    pub reservoir_icon: u8,
    pub cgm_display_data: bool,
}

impl From<HomeScreenRaw> for HomeScreenMirror {
    fn from(raw: HomeScreenRaw) -> Self {
        Self {
            trend: TrendArrow::try_from(raw.cgm_trend_icon).ok(),
            cgm_alert_icon: raw.cgm_alert_icon,
            status_icons: [raw.status_icon0, raw.status_icon1],
            bolus_status_icon: raw.bolus_status_icon,
            basal_status_icon: raw.basal_status_icon,
            control_state_icon: raw.control_state_icon,
            reservoir_icon: raw.reservoir_icon,
            cgm_display_data: raw.cgm_display_data != 0,
        }
    }
}

pub fn decode_home_screen(cargo: &[u8]) -> Option<HomeScreenMirror> {
    read_raw::<HomeScreenRaw>(cargo).map(HomeScreenMirror::from)
}

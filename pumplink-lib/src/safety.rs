use crate::constants::{ABSOLUTE_MAX_BOLUS_MILLIUNITS, CGM_MAX_PLAUSIBLE_MG_DL};
use crate::error::PumpError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

fn default_glucose_min() -> u16 {
    20
}

fn default_glucose_max() -> u16 {
    500
}

fn default_max_basal() -> u32 {
    15_000
}

fn default_max_bolus() -> u32 {
    25_000
}

/// Bounds every decoded glucose or dosing value must fall within.
///
/// Insulin amounts are milliunits (basal per hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLimits {
    #[serde(default = "default_glucose_min")]
    pub glucose_min: u16,
    #[serde(default = "default_glucose_max")]
    pub glucose_max: u16,
    #[serde(default = "default_max_basal")]
    pub max_basal_milliunits: u32,
    #[serde(default = "default_max_bolus")]
    pub max_bolus_milliunits: u32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            glucose_min: default_glucose_min(),
            glucose_max: default_glucose_max(),
            max_basal_milliunits: default_max_basal(),
            max_bolus_milliunits: default_max_bolus(),
        }
    }
}

impl SafetyLimits {
    pub fn validate(&self) -> Result<(), PumpError> {
        if self.glucose_min == 0 || self.glucose_min >= self.glucose_max {
            return Err(PumpError::InvalidConfig(format!(
                "glucose range {}..={} is empty",
                self.glucose_min, self.glucose_max
            )));
        }
        if self.glucose_max > CGM_MAX_PLAUSIBLE_MG_DL {
            return Err(PumpError::InvalidConfig(format!(
                "glucose_max {} above sensor range {CGM_MAX_PLAUSIBLE_MG_DL}",
                self.glucose_max
            )));
        }
        if self.max_basal_milliunits == 0 || self.max_bolus_milliunits == 0 {
            return Err(PumpError::InvalidConfig("insulin limits must be positive".into()));
        }
        Ok(())
    }

    pub fn check_glucose(&self, mg_dl: u16) -> bool {
        (self.glucose_min..=self.glucose_max).contains(&mg_dl)
    }

    pub fn check_basal(&self, milliunits_per_hour: u32) -> bool {
        milliunits_per_hour <= self.max_basal_milliunits
    }

    /// The configured cap never lifts the bolus ceiling above 25 U.
    pub fn check_bolus(&self, milliunits: u32) -> bool {
        milliunits <= self.effective_max_bolus()
    }

    pub fn effective_max_bolus(&self) -> u32 {
        self.max_bolus_milliunits.min(ABSOLUTE_MAX_BOLUS_MILLIUNITS)
    }
}

/// Publishes the current limits to every decoder and poll loop.
#[derive(Debug, Clone)]
pub struct LimitsHandle {
    sender: Arc<watch::Sender<SafetyLimits>>,
}

impl LimitsHandle {
    pub fn new(limits: SafetyLimits) -> Self {
        let (sender, _) = watch::channel(limits);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn current(&self) -> SafetyLimits {
        *self.sender.borrow()
    }

    /// Replace the limits; readers see the new value on their next check.
    pub fn update(&self, limits: SafetyLimits) -> Result<(), PumpError> {
        limits.validate()?;
        tracing::info!(?limits, "safety limits updated");
        self.sender.send_replace(limits);
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<SafetyLimits> {
        self.sender.subscribe()
    }
}

impl Default for LimitsHandle {
    fn default() -> Self {
        Self::new(SafetyLimits::default())
    }
}

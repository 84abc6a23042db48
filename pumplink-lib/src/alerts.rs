//! Glucose threshold alerts.
//!
//! `AlertMonitor` classifies each CGM value and emits an event only when the
//! classification changes. `AlertDeduper` is the set of alerts currently
//! raised; it is shared between the polling path and whoever acknowledges
//! alerts, so it sits behind one mutex.

use crate::error::PumpError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strum_macros::Display;

fn default_urgent_low() -> u16 {
    55
}

fn default_low() -> u16 {
    70
}

fn default_high() -> u16 {
    250
}

fn default_urgent_high() -> u16 {
    300
}

fn default_dedup_capacity() -> usize {
    32
}

/// Four ordered thresholds in mg/dL. Lows are inclusive upper bounds, highs
/// inclusive lower bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlucoseThresholds {
    #[serde(default = "default_urgent_low")]
    pub urgent_low: u16,
    #[serde(default = "default_low")]
    pub low: u16,
    #[serde(default = "default_high")]
    pub high: u16,
    #[serde(default = "default_urgent_high")]
    pub urgent_high: u16,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

impl Default for GlucoseThresholds {
    fn default() -> Self {
        Self {
            urgent_low: default_urgent_low(),
            low: default_low(),
            high: default_high(),
            urgent_high: default_urgent_high(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

impl GlucoseThresholds {
    pub fn validate(&self) -> Result<(), PumpError> {
        if !(self.urgent_low < self.low && self.low < self.high && self.high < self.urgent_high) {
            return Err(PumpError::InvalidConfig(format!(
                "alert thresholds must be strictly increasing, got {}/{}/{}/{}",
                self.urgent_low, self.low, self.high, self.urgent_high
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(PumpError::InvalidConfig("dedup_capacity must be positive".into()));
        }
        Ok(())
    }

    /// `None` means the value is in range.
    pub fn classify(&self, mg_dl: u16) -> Option<AlertKind> {
        if mg_dl <= self.urgent_low {
            Some(AlertKind::UrgentLow)
        } else if mg_dl <= self.low {
            Some(AlertKind::Low)
        } else if mg_dl >= self.urgent_high {
            Some(AlertKind::UrgentHigh)
        } else if mg_dl >= self.high {
            Some(AlertKind::High)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    UrgentLow,
    Low,
    High,
    UrgentHigh,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub glucose_mg_dl: u16,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AlertEvent {
    Raised(Alert),
    Cleared { kind: AlertKind },
}

/// Receives alert transitions.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &Alert) -> Result<(), PumpError>;
    fn clear(&self, kind: AlertKind) -> Result<(), PumpError>;
}

#[derive(Debug, Clone, Copy)]
struct ActiveAlert {
    kind: AlertKind,
    acknowledged: bool,
}

/// Bounded set of raised alerts; the oldest entry is evicted when full.
#[derive(Debug)]
pub struct AlertDeduper {
    active: Mutex<VecDeque<ActiveAlert>>,
    capacity: usize,
}

impl AlertDeduper {
    pub fn new(capacity: usize) -> Self {
        Self {
            active: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ActiveAlert>> {
        // the set holds plain values, so a poisoned lock is still consistent
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if `kind` was not already raised and now is.
    pub fn try_raise(&self, kind: AlertKind) -> bool {
        let mut active = self.lock();
        if active.iter().any(|a| a.kind == kind) {
            return false;
        }
        if active.len() >= self.capacity {
            active.pop_front();
        }
        active.push_back(ActiveAlert {
            kind,
            acknowledged: false,
        });
        true
    }

    /// Forget `kind`; returns whether it was raised.
    pub fn clear(&self, kind: AlertKind) -> bool {
        let mut active = self.lock();
        let before = active.len();
        active.retain(|a| a.kind != kind);
        active.len() != before
    }

    /// User acknowledgement. The alert stays raised, and so is not sent
    /// again, until the condition clears.
    pub fn acknowledge(&self, kind: AlertKind) -> bool {
        let mut active = self.lock();
        match active.iter_mut().find(|a| a.kind == kind) {
            Some(alert) => {
                alert.acknowledged = true;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, kind: AlertKind) -> bool {
        self.lock().iter().any(|a| a.kind == kind)
    }

    pub fn is_acknowledged(&self, kind: AlertKind) -> bool {
        self.lock().iter().any(|a| a.kind == kind && a.acknowledged)
    }

    pub fn active(&self) -> Vec<AlertKind> {
        self.lock().iter().map(|a| a.kind).collect()
    }
}

/// Turns a stream of glucose values into alert transitions.
#[derive(Debug)]
pub struct AlertMonitor {
    thresholds: GlucoseThresholds,
    current: Option<AlertKind>,
    dedup: Arc<AlertDeduper>,
}

impl AlertMonitor {
    pub fn new(thresholds: GlucoseThresholds, dedup: Arc<AlertDeduper>) -> Self {
        Self {
            thresholds,
            current: None,
            dedup,
        }
    }

    pub fn dedup(&self) -> &Arc<AlertDeduper> {
        &self.dedup
    }

    pub fn thresholds(&self) -> GlucoseThresholds {
        self.thresholds
    }

    pub fn observe(&mut self, mg_dl: u16) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        let class = self.thresholds.classify(mg_dl);
        if class == self.current {
            return events;
        }

        if let Some(previous) = self.current.take() {
            self.dedup.clear(previous);
            events.push(AlertEvent::Cleared { kind: previous });
        }
        if let Some(kind) = class {
            if self.dedup.try_raise(kind) {
                events.push(AlertEvent::Raised(Alert {
                    kind,
                    glucose_mg_dl: mg_dl,
                    raised_at: Utc::now(),
                }));
            }
            self.current = Some(kind);
        }
        events
    }
}

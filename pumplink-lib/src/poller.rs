//! Multi-rate polling of a paired pump.
//!
//! Three loops share one session:
//!   - fast: IoB, basal (+ settings for the mode), CGM (+ home screen for the trend)
//!   - medium: last bolus
//!   - slow: battery, reservoir, history log, hardware info
//!
//! Each loop issues its requests in order, `stagger` apart, and every request
//! takes the session mutex, so the pump never sees two requests in flight.
//! When the connection drops the loops are cancelled; on reconnect they start
//! again with the shorter reconnect delays.

use crate::alerts::{AlertDeduper, AlertEvent, AlertMonitor, AlertSink, GlucoseThresholds};
use crate::device::PumpSession;
use crate::error::PumpError;
use crate::history::{
    HistoryEvent, HistoryLogRecord, decode_history_ack, decode_history_status, decode_history_stream, extract_events,
    history_request_cargo,
};
use crate::message::MessageKind;
use crate::safety::SafetyLimits;
use crate::status::{
    PumpHardwareInfo, Reading, decode_basal, decode_battery_v1, decode_battery_v2, decode_cgm, decode_home_screen,
    decode_iob, decode_last_bolus, decode_pump_features, decode_pump_settings, decode_pump_version,
    decode_reservoir,
};
use crate::transport::{ChunkTransport, ConnectionState};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn default_fast_interval() -> u64 {
    30
}
fn default_fast_initial_delay() -> u64 {
    2
}
fn default_medium_interval() -> u64 {
    60
}
fn default_medium_initial_delay() -> u64 {
    20
}
fn default_medium_reconnect_delay() -> u64 {
    3
}
fn default_slow_interval() -> u64 {
    300
}
fn default_slow_initial_delay() -> u64 {
    45
}
fn default_slow_reconnect_delay() -> u64 {
    5
}
fn default_stagger_ms() -> u64 {
    500
}
fn default_low_battery_multiplier() -> u32 {
    2
}
fn default_low_battery_percent() -> u8 {
    20
}
fn default_history_batch() -> u8 {
    16
}

/// Poll schedule. Intervals and delays are seconds, the stagger milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_fast_interval")]
    pub fast_interval_secs: u64,
    #[serde(default = "default_fast_initial_delay")]
    pub fast_initial_delay_secs: u64,
    #[serde(default = "default_medium_interval")]
    pub medium_interval_secs: u64,
    #[serde(default = "default_medium_initial_delay")]
    pub medium_initial_delay_secs: u64,
    #[serde(default = "default_medium_reconnect_delay")]
    pub medium_reconnect_delay_secs: u64,
    #[serde(default = "default_slow_interval")]
    pub slow_interval_secs: u64,
    #[serde(default = "default_slow_initial_delay")]
    pub slow_initial_delay_secs: u64,
    #[serde(default = "default_slow_reconnect_delay")]
    pub slow_reconnect_delay_secs: u64,
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    #[serde(default = "default_low_battery_multiplier")]
    pub low_battery_multiplier: u32,
    /// Pump battery at or below this percentage switches to low power; 0 never does.
    #[serde(default = "default_low_battery_percent")]
    pub low_battery_percent: u8,
    #[serde(default = "default_history_batch")]
    pub history_batch: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: default_fast_interval(),
            fast_initial_delay_secs: default_fast_initial_delay(),
            medium_interval_secs: default_medium_interval(),
            medium_initial_delay_secs: default_medium_initial_delay(),
            medium_reconnect_delay_secs: default_medium_reconnect_delay(),
            slow_interval_secs: default_slow_interval(),
            slow_initial_delay_secs: default_slow_initial_delay(),
            slow_reconnect_delay_secs: default_slow_reconnect_delay(),
            stagger_ms: default_stagger_ms(),
            low_battery_multiplier: default_low_battery_multiplier(),
            low_battery_percent: default_low_battery_percent(),
            history_batch: default_history_batch(),
        }
    }
}

impl PollConfig {
    pub fn validate(&self) -> Result<(), PumpError> {
        if self.fast_interval_secs == 0 || self.medium_interval_secs == 0 || self.slow_interval_secs == 0 {
            return Err(PumpError::InvalidConfig("poll intervals must be positive".into()));
        }
        if self.low_battery_multiplier == 0 {
            return Err(PumpError::InvalidConfig("low_battery_multiplier must be at least 1".into()));
        }
        if self.low_battery_percent > 100 {
            return Err(PumpError::InvalidConfig("low_battery_percent must be at most 100".into()));
        }
        if self.history_batch == 0 {
            return Err(PumpError::InvalidConfig("history_batch must be positive".into()));
        }
        Ok(())
    }

    pub fn is_low_battery(&self, percent: u8) -> bool {
        percent <= self.low_battery_percent && self.low_battery_percent > 0
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    fn initial_delays(&self, reconnect: bool) -> [Duration; 3] {
        let (medium, slow) = if reconnect {
            (self.medium_reconnect_delay_secs, self.slow_reconnect_delay_secs)
        } else {
            (self.medium_initial_delay_secs, self.slow_initial_delay_secs)
        };
        [
            Duration::from_secs(self.fast_initial_delay_secs),
            Duration::from_secs(medium),
            Duration::from_secs(slow),
        ]
    }
}

/// Receives every decoded reading, e.g. local storage or the upload queue.
pub trait ReadingSink: Send + Sync {
    fn accept(&self, reading: &Reading) -> Result<(), PumpError>;
}

/// Forwards readings into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Reading>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Reading>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReadingSink for ChannelSink {
    fn accept(&self, reading: &Reading) -> Result<(), PumpError> {
        self.tx
            .send(reading.clone())
            .map_err(|_| PumpError::Sink("reading channel closed".into()))
    }
}

struct PollContext<T> {
    session: Arc<Mutex<PumpSession<T>>>,
    config: PollConfig,
    limits: watch::Receiver<SafetyLimits>,
    connection: watch::Receiver<ConnectionState>,
    low_power: watch::Receiver<bool>,
    battery_low: AtomicBool,
    sinks: Vec<Arc<dyn ReadingSink>>,
    alert_sinks: Vec<Arc<dyn AlertSink>>,
}

impl<T: ChunkTransport> PollContext<T> {
    fn limits(&self) -> SafetyLimits {
        *self.limits.borrow()
    }

    fn is_connected(&self) -> bool {
        self.connection.borrow().is_connected()
    }

    fn interval(&self, secs: u64) -> Duration {
        let base = Duration::from_secs(secs);
        if *self.low_power.borrow() || self.battery_low.load(Ordering::Relaxed) {
            base * self.config.low_battery_multiplier
        } else {
            base
        }
    }

    /// Issue one request unless cancelled or disconnected. Failures are
    /// logged and reported as `None`.
    async fn fetch(&self, token: &CancellationToken, kind: MessageKind, cargo: Bytes) -> Option<Bytes> {
        if token.is_cancelled() || !self.is_connected() {
            return None;
        }
        let mut session = self.session.lock().await;
        if token.is_cancelled() || !self.is_connected() {
            return None;
        }
        let result = tokio::select! {
            _ = token.cancelled() => return None,
            result = session.request(kind, cargo) => result,
        };
        match result {
            Ok(cargo) => Some(cargo),
            Err(e) => {
                warn!(%kind, error = %e, "read failed, skipping");
                None
            }
        }
    }

    /// Sleep for the stagger; false once cancelled.
    async fn stagger(&self, token: &CancellationToken) -> bool {
        sleep_or_cancel(self.config.stagger(), token).await
    }

    fn emit(&self, reading: Reading) {
        debug!(reading = reading.name(), "decoded");
        for sink in &self.sinks {
            if let Err(e) = sink.accept(&reading) {
                warn!(reading = reading.name(), error = %e, "sink rejected reading");
            }
        }
    }

    fn dispatch_alerts(&self, events: Vec<AlertEvent>) {
        for event in events {
            match &event {
                AlertEvent::Raised(alert) => info!(kind = %alert.kind, glucose = alert.glucose_mg_dl, "alert raised"),
                AlertEvent::Cleared { kind } => info!(%kind, "alert cleared"),
            }
            for sink in &self.alert_sinks {
                let result = match &event {
                    AlertEvent::Raised(alert) => sink.raise(alert),
                    AlertEvent::Cleared { kind } => sink.clear(*kind),
                };
                if let Err(e) = result {
                    warn!(error = %e, "alert sink failed");
                }
            }
        }
    }

    async fn poll_fast(&self, token: &CancellationToken, monitor: &mut AlertMonitor) {
        if let Some(iob) = self
            .fetch(token, MessageKind::ControlIqIob, Bytes::new())
            .await
            .and_then(|c| decode_iob(&c))
        {
            self.emit(Reading::Iob(iob));
        }
        if !self.stagger(token).await {
            return;
        }

        let basal = self
            .fetch(token, MessageKind::CurrentBasalStatus, Bytes::new())
            .await
            .and_then(|c| decode_basal(&c, &self.limits()));
        if !self.stagger(token).await {
            return;
        }
        let settings = self
            .fetch(token, MessageKind::PumpSettings, Bytes::new())
            .await
            .and_then(|c| decode_pump_settings(&c));
        if let Some(basal) = basal {
            let basal = match &settings {
                Some(settings) => basal.with_mode(settings),
                None => basal,
            };
            self.emit(Reading::Basal(basal));
        }
        if !self.stagger(token).await {
            return;
        }

        let cgm = self
            .fetch(token, MessageKind::CurrentEgv, Bytes::new())
            .await
            .and_then(|c| decode_cgm(&c, &self.limits()));
        if !self.stagger(token).await {
            return;
        }
        let mirror = self
            .fetch(token, MessageKind::HomeScreenMirror, Bytes::new())
            .await
            .and_then(|c| decode_home_screen(&c));
        if let Some(cgm) = cgm {
            let cgm = match &mirror {
                Some(mirror) => cgm.with_trend(mirror),
                None => cgm,
            };
            let glucose = cgm.glucose_mg_dl;
            self.emit(Reading::Cgm(cgm));
            self.dispatch_alerts(monitor.observe(glucose));
        }
    }

    /// Returns the id of the last bolus emitted so repeats are not resent.
    async fn poll_medium(&self, token: &CancellationToken, last_bolus: Option<u16>) -> Option<u16> {
        let Some(event) = self
            .fetch(token, MessageKind::LastBolusStatus, Bytes::new())
            .await
            .and_then(|c| decode_last_bolus(&c, &self.limits()))
        else {
            return last_bolus;
        };
        if last_bolus == Some(event.bolus_id) {
            return last_bolus;
        }
        let id = event.bolus_id;
        self.emit(Reading::Bolus(event));
        Some(id)
    }

    /// Returns the highest history sequence number seen.
    async fn poll_slow(&self, token: &CancellationToken, cursor: Option<u32>) -> Option<u32> {
        let battery = match self
            .fetch(token, MessageKind::CurrentBatteryV2, Bytes::new())
            .await
            .and_then(|c| decode_battery_v2(&c))
        {
            Some(battery) => Some(battery),
            None => {
                if !self.stagger(token).await {
                    return cursor;
                }
                debug!("battery v2 unavailable, trying v1");
                self.fetch(token, MessageKind::CurrentBatteryV1, Bytes::new())
                    .await
                    .and_then(|c| decode_battery_v1(&c))
            }
        };
        if let Some(battery) = battery {
            let low = self.config.is_low_battery(battery.percent);
            if self.battery_low.swap(low, Ordering::Relaxed) != low {
                info!(percent = battery.percent, low_power = low, "pump battery changed poll rate");
            }
            self.emit(Reading::Battery(battery));
        }
        if !self.stagger(token).await {
            return cursor;
        }

        if let Some(reservoir) = self
            .fetch(token, MessageKind::InsulinStatus, Bytes::new())
            .await
            .and_then(|c| decode_reservoir(&c))
        {
            self.emit(Reading::Reservoir(reservoir));
        }
        if !self.stagger(token).await {
            return cursor;
        }

        let cursor = self.poll_history(token, cursor).await;
        if !self.stagger(token).await {
            return cursor;
        }

        let version = self
            .fetch(token, MessageKind::PumpVersion, Bytes::new())
            .await
            .and_then(|c| decode_pump_version(&c));
        if !self.stagger(token).await {
            return cursor;
        }
        let features = self
            .fetch(token, MessageKind::PumpFeatures, Bytes::new())
            .await
            .and_then(|c| decode_pump_features(&c));
        if let Some(version) = version {
            let info = PumpHardwareInfo::from(version);
            let info = match features {
                Some(features) => info.with_features(features),
                None => info,
            };
            self.emit(Reading::HardwareInfo(info));
        }
        cursor
    }

    async fn poll_history(&self, token: &CancellationToken, cursor: Option<u32>) -> Option<u32> {
        let Some(status) = self
            .fetch(token, MessageKind::HistoryLogStatus, Bytes::new())
            .await
            .and_then(|c| decode_history_status(&c))
        else {
            return cursor;
        };
        if status.entries == 0 {
            return cursor;
        }

        let batch = self.config.history_batch as u32;
        let start = match cursor {
            Some(seen) => seen.saturating_add(1),
            None => status.last_sequence.saturating_sub(batch - 1),
        }
        .max(status.first_sequence);
        if start > status.last_sequence {
            return cursor;
        }
        let count = (status.last_sequence - start + 1).min(batch) as u8;
        if !self.stagger(token).await {
            return cursor;
        }

        let records = match self.fetch_history(token, start, count).await {
            Ok(records) => records,
            Err(e) => {
                warn!(start, count, error = %e, "history read failed, skipping");
                return cursor;
            }
        };
        let mut newest = cursor;
        for record in &records {
            newest = Some(newest.map_or(record.sequence, |n| n.max(record.sequence)));
        }
        for event in extract_events(&records, &self.limits()) {
            self.emit(match event {
                HistoryEvent::Bolus(bolus) => Reading::Bolus(bolus),
                HistoryEvent::Basal(basal) => Reading::BasalDelivery(basal),
            });
        }
        for record in records {
            self.emit(Reading::HistoryRecord(record));
        }
        newest
    }

    /// Request `count` records from `start` and collect the stream messages
    /// that follow, holding the session for the whole exchange.
    async fn fetch_history(
        &self,
        token: &CancellationToken,
        start: u32,
        count: u8,
    ) -> Result<Vec<HistoryLogRecord>, PumpError> {
        if token.is_cancelled() || !self.is_connected() {
            return Err(PumpError::NotConnected);
        }
        let mut session = self.session.lock().await;
        let exchange = async {
            let cargo = Bytes::copy_from_slice(&history_request_cargo(start, count));
            let ack = session.request(MessageKind::HistoryLog, cargo).await?;
            let ack = decode_history_ack(&ack).ok_or(PumpError::MalformedResponse("history log ack"))?;
            if ack.status != 0 {
                return Err(PumpError::MalformedResponse("history log request refused"));
            }
            let mut records = Vec::with_capacity(count as usize);
            while records.len() < count as usize {
                let batch = decode_history_stream(&session.receive_stream(ack.stream_id).await?);
                if batch.is_empty() {
                    break;
                }
                records.extend(batch);
            }
            Ok(records)
        };
        tokio::select! {
            _ = token.cancelled() => Err(PumpError::NotConnected),
            result = exchange => result,
        }
    }
}

async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn fast_loop<T: ChunkTransport>(
    ctx: Arc<PollContext<T>>,
    mut monitor: AlertMonitor,
    initial: Duration,
    token: CancellationToken,
) -> AlertMonitor {
    if !sleep_or_cancel(initial, &token).await {
        return monitor;
    }
    loop {
        ctx.poll_fast(&token, &mut monitor).await;
        if !sleep_or_cancel(ctx.interval(ctx.config.fast_interval_secs), &token).await {
            return monitor;
        }
    }
}

async fn medium_loop<T: ChunkTransport>(
    ctx: Arc<PollContext<T>>,
    mut last_bolus: Option<u16>,
    initial: Duration,
    token: CancellationToken,
) -> Option<u16> {
    if !sleep_or_cancel(initial, &token).await {
        return last_bolus;
    }
    loop {
        last_bolus = ctx.poll_medium(&token, last_bolus).await;
        if !sleep_or_cancel(ctx.interval(ctx.config.medium_interval_secs), &token).await {
            return last_bolus;
        }
    }
}

async fn slow_loop<T: ChunkTransport>(
    ctx: Arc<PollContext<T>>,
    mut cursor: Option<u32>,
    initial: Duration,
    token: CancellationToken,
) -> Option<u32> {
    if !sleep_or_cancel(initial, &token).await {
        return cursor;
    }
    loop {
        cursor = ctx.poll_slow(&token, cursor).await;
        if !sleep_or_cancel(ctx.interval(ctx.config.slow_interval_secs), &token).await {
            return cursor;
        }
    }
}

/// Drives the three poll loops for as long as it runs.
pub struct Poller<T> {
    session: Arc<Mutex<PumpSession<T>>>,
    config: PollConfig,
    limits: watch::Receiver<SafetyLimits>,
    connection: watch::Receiver<ConnectionState>,
    low_power: watch::Receiver<bool>,
    sinks: Vec<Arc<dyn ReadingSink>>,
    alert_sinks: Vec<Arc<dyn AlertSink>>,
    monitor: AlertMonitor,
}

impl<T: ChunkTransport + 'static> Poller<T> {
    pub fn new(
        session: Arc<Mutex<PumpSession<T>>>,
        config: PollConfig,
        connection: watch::Receiver<ConnectionState>,
        limits: watch::Receiver<SafetyLimits>,
    ) -> Self {
        // without an external source only pump battery readings switch low power
        let (_, low_power) = watch::channel(false);
        let thresholds = GlucoseThresholds::default();
        let dedup = Arc::new(AlertDeduper::new(thresholds.dedup_capacity));
        Self {
            session,
            config,
            limits,
            connection,
            low_power,
            sinks: Vec::new(),
            alert_sinks: Vec::new(),
            monitor: AlertMonitor::new(thresholds, dedup),
        }
    }

    /// An extra low-power source, e.g. the host's own battery.
    pub fn with_low_power(mut self, low_power: watch::Receiver<bool>) -> Self {
        self.low_power = low_power;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ReadingSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sinks.push(sink);
        self
    }

    /// Use `dedup` so acknowledgements from elsewhere reach the monitor.
    pub fn with_alerts(mut self, thresholds: GlucoseThresholds, dedup: Arc<AlertDeduper>) -> Self {
        self.monitor = AlertMonitor::new(thresholds, dedup);
        self
    }

    pub fn alert_dedup(&self) -> Arc<AlertDeduper> {
        self.monitor.dedup().clone()
    }

    /// Poll while connected, pause while disconnected, until `shutdown`.
    pub async fn run(self, shutdown: CancellationToken) {
        let Poller {
            session,
            config,
            limits,
            mut connection,
            low_power,
            sinks,
            alert_sinks,
            mut monitor,
        } = self;
        let ctx = Arc::new(PollContext {
            session,
            config,
            limits,
            connection: connection.clone(),
            low_power,
            battery_low: AtomicBool::new(false),
            sinks,
            alert_sinks,
        });

        let mut last_bolus = None;
        let mut cursor = None;
        let mut reconnect = false;

        loop {
            let connected = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = connection.wait_for(|state| state.is_connected()) => result.is_ok(),
            };
            if !connected {
                info!("connection state source closed, polling stops");
                return;
            }

            let [fast_delay, medium_delay, slow_delay] = ctx.config.initial_delays(reconnect);
            info!(reconnect, "connected, starting poll loops");
            reconnect = true;

            let token = shutdown.child_token();
            let fallback_monitor = AlertMonitor::new(monitor.thresholds(), monitor.dedup().clone());
            let fast = tokio::spawn(fast_loop(ctx.clone(), monitor, fast_delay, token.clone()));
            let medium = tokio::spawn(medium_loop(ctx.clone(), last_bolus, medium_delay, token.clone()));
            let slow = tokio::spawn(slow_loop(ctx.clone(), cursor, slow_delay, token.clone()));

            let source_closed = tokio::select! {
                _ = shutdown.cancelled() => true,
                result = connection.wait_for(|state| !state.is_connected()) => result.is_err(),
            };
            token.cancel();
            if !source_closed {
                info!("connection lost, poll loops stopped");
            }

            monitor = fast.await.unwrap_or_else(|e| {
                warn!(error = %e, "fast poll loop ended abnormally");
                fallback_monitor
            });
            last_bolus = medium.await.unwrap_or_else(|e| {
                warn!(error = %e, "medium poll loop ended abnormally");
                None
            });
            cursor = slow.await.unwrap_or_else(|e| {
                warn!(error = %e, "slow poll loop ended abnormally");
                None
            });
            ctx.session.lock().await.reset();

            if source_closed {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = PollConfig::default();
        assert_eq!(config.fast_interval_secs, 30);
        assert_eq!(config.stagger(), Duration::from_millis(500));
        assert_eq!(config.low_battery_multiplier, 2);
        assert_eq!(config.history_batch, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_delays() {
        let config = PollConfig::default();
        assert_eq!(
            config.initial_delays(false),
            [Duration::from_secs(2), Duration::from_secs(20), Duration::from_secs(45)]
        );
        assert_eq!(
            config.initial_delays(true),
            [Duration::from_secs(2), Duration::from_secs(3), Duration::from_secs(5)]
        );
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: PollConfig = serde_json::from_str(r#"{"fast_interval_secs": 15}"#).unwrap();
        assert_eq!(config.fast_interval_secs, 15);
        assert_eq!(config.slow_interval_secs, 300);
    }

    #[test]
    fn test_low_battery_threshold() {
        let config = PollConfig::default();
        assert!(config.is_low_battery(20));
        assert!(!config.is_low_battery(21));
        let never = PollConfig {
            low_battery_percent: 0,
            ..PollConfig::default()
        };
        assert!(!never.is_low_battery(0));
    }

    #[test]
    fn test_config_validate() {
        let bad = PollConfig {
            low_battery_multiplier: 0,
            ..PollConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_channel_sink() {
        let (sink, mut rx) = ChannelSink::new();
        let reading = Reading::Battery(crate::status::BatteryReading {
            percent: 50,
            charging: false,
        });
        sink.accept(&reading).unwrap();
        assert_eq!(rx.recv().await, Some(reading.clone()));
        drop(rx);
        assert!(sink.accept(&reading).is_err());
    }
}

mod common;

use common::*;
use pumplink_lib::alerts::{Alert, AlertDeduper, AlertKind, AlertSink, GlucoseThresholds};
use pumplink_lib::error::PumpError;
use pumplink_lib::message::MessageKind;
use pumplink_lib::poller::ChannelSink;
use pumplink_lib::safety::LimitsHandle;
use pumplink_lib::status::{Reading, TrendArrow, UserMode};
use pumplink_lib::{ConnectionState, PollConfig, Poller, PumpSession};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct RecordingAlerts {
    raised: Mutex<Vec<AlertKind>>,
    cleared: Mutex<Vec<AlertKind>>,
}

impl AlertSink for RecordingAlerts {
    fn raise(&self, alert: &Alert) -> Result<(), PumpError> {
        self.raised.lock().unwrap().push(alert.kind);
        Ok(())
    }

    fn clear(&self, kind: AlertKind) -> Result<(), PumpError> {
        self.cleared.lock().unwrap().push(kind);
        Ok(())
    }
}

struct Harness {
    log: RequestLog,
    readings: mpsc::UnboundedReceiver<Reading>,
    alerts: Arc<RecordingAlerts>,
    connection: watch::Sender<ConnectionState>,
    low_power: watch::Sender<bool>,
    limits: LimitsHandle,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    start: Instant,
}

impl Harness {
    fn start(script: PumpScript) -> Self {
        Self::start_with(script, false)
    }

    fn start_with(script: PumpScript, low_power: bool) -> Self {
        let start = Instant::now();
        let (transport, log) = spawn_pump(script);
        let (connection, connection_rx) = watch::channel(ConnectionState::Connected);
        let (low_power, low_power_rx) = watch::channel(low_power);
        let session = PumpSession::new(transport).with_connection_state(connection_rx.clone());
        let limits = LimitsHandle::default();
        let (sink, readings) = ChannelSink::new();
        let alerts = Arc::new(RecordingAlerts::default());
        let thresholds = GlucoseThresholds::default();

        let poller = Poller::new(
            Arc::new(tokio::sync::Mutex::new(session)),
            PollConfig::default(),
            connection_rx,
            limits.subscribe(),
        )
        .with_low_power(low_power_rx)
        .with_sink(Arc::new(sink))
        .with_alert_sink(alerts.clone())
        .with_alerts(thresholds, Arc::new(AlertDeduper::new(thresholds.dedup_capacity)));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(poller.run(shutdown.clone()));
        Self {
            log,
            readings,
            alerts,
            connection,
            low_power,
            limits,
            shutdown,
            handle,
            start,
        }
    }

    async fn advance_to(&self, secs: f64) {
        let target = self.start + Duration::from_secs_f64(secs);
        tokio::time::sleep_until(target).await;
    }

    fn offsets(&self, kind: MessageKind) -> Vec<Duration> {
        self.log.times_of(kind).into_iter().map(|t| t - self.start).collect()
    }

    fn drain(&mut self) -> Vec<Reading> {
        let mut out = Vec::new();
        while let Ok(r) = self.readings.try_recv() {
            out.push(r);
        }
        out
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

#[tokio::test(start_paused = true)]
async fn test_first_cycle_schedule() {
    let h = Harness::start(full_script());
    h.advance_to(50.0).await;

    assert_eq!(h.offsets(MessageKind::ControlIqIob), vec![secs(2.0), secs(34.0)]);
    assert_eq!(h.offsets(MessageKind::CurrentBasalStatus), vec![secs(2.5), secs(34.5)]);
    assert_eq!(h.offsets(MessageKind::LastBolusStatus), vec![secs(20.0)]);
    assert_eq!(h.offsets(MessageKind::CurrentBatteryV2), vec![secs(45.0)]);
    assert_eq!(h.offsets(MessageKind::InsulinStatus), vec![secs(45.5)]);
    assert_eq!(h.offsets(MessageKind::PumpFeatures), vec![secs(47.0)]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_fast_cycle_readings_are_merged() {
    let mut h = Harness::start(full_script());
    h.advance_to(10.0).await;

    let readings = h.drain();
    assert_eq!(
        readings.iter().map(Reading::name).collect::<Vec<_>>(),
        vec!["iob", "basal", "cgm"]
    );
    let Reading::Basal(basal) = &readings[1] else {
        panic!("expected basal");
    };
    assert_eq!(basal.mode, Some(UserMode::Standard));
    let Reading::Cgm(cgm) = &readings[2] else {
        panic!("expected cgm");
    };
    assert_eq!(cgm.glucose_mg_dl, 120);
    assert_eq!(cgm.trend, Some(TrendArrow::Flat));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_slow_cycle_readings() {
    let mut h = Harness::start(full_script());
    h.advance_to(50.0).await;

    let names: Vec<_> = h.drain().iter().map(Reading::name).collect();
    assert!(names.contains(&"bolus"));
    assert!(names.contains(&"battery"));
    assert!(names.contains(&"reservoir"));
    assert!(names.contains(&"hardware_info"));
    // empty history log: no stream request
    assert_eq!(h.log.count(MessageKind::HistoryLog), 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_last_bolus_emitted_once() {
    let mut h = Harness::start(full_script());
    h.advance_to(150.0).await;

    assert_eq!(h.log.count(MessageKind::LastBolusStatus), 3);
    let bolus_count = h.drain().iter().filter(|r| r.name() == "bolus").count();
    assert_eq!(bolus_count, 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_and_reconnect_uses_short_delays() {
    let h = Harness::start(full_script());
    h.advance_to(10.0).await;
    h.connection.send_replace(ConnectionState::Disconnected);
    let seen = h.log.len();

    h.advance_to(200.0).await;
    assert_eq!(h.log.len(), seen, "no requests while disconnected");
    assert!(h.log.times_of(MessageKind::LastBolusStatus).is_empty());

    h.connection.send_replace(ConnectionState::Connected);
    h.advance_to(210.0).await;

    assert_eq!(h.offsets(MessageKind::ControlIqIob).last(), Some(&secs(202.0)));
    assert_eq!(h.offsets(MessageKind::LastBolusStatus), vec![secs(203.0)]);
    assert_eq!(h.offsets(MessageKind::CurrentBatteryV2), vec![secs(205.0)]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_power_stretches_intervals() {
    let h = Harness::start_with(full_script(), true);
    h.advance_to(65.0).await;

    // fast cycle ends at 4 s, then waits 2 x 30 s
    assert_eq!(h.offsets(MessageKind::ControlIqIob), vec![secs(2.0), secs(64.0)]);
    // picked up when the running cycle (ending at 66 s) schedules the next
    h.low_power.send_replace(false);
    h.advance_to(100.0).await;
    assert_eq!(h.offsets(MessageKind::ControlIqIob).last(), Some(&secs(96.0)));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_pump_battery_stretches_intervals() {
    let script = full_script().respond(MessageKind::CurrentBatteryV2, battery_v2_cargo(15, 0));
    let h = Harness::start(script);
    h.advance_to(130.0).await;

    // battery read at 45 s; the cycle ending at 68 s waits 2 x 30 s
    assert_eq!(
        h.offsets(MessageKind::ControlIqIob),
        vec![secs(2.0), secs(34.0), secs(66.0), secs(128.0)]
    );
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_limits_update_applies_to_next_cycle() {
    let script = full_script().respond(MessageKind::CurrentEgv, cgm_cargo(600_000, 450, 1, 0));
    let mut h = Harness::start(script);
    h.advance_to(10.0).await;
    assert!(h.drain().iter().any(|r| r.name() == "cgm"));

    let mut limits = h.limits.current();
    limits.glucose_max = 400;
    h.limits.update(limits).unwrap();
    h.advance_to(40.0).await;

    assert_eq!(h.offsets(MessageKind::CurrentEgv), vec![secs(3.5), secs(35.5)]);
    assert!(h.drain().iter().all(|r| r.name() != "cgm"));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_read_is_skipped() {
    let mut script = full_script();
    script.responses.remove(&MessageKind::ControlIqIob);
    script.responses.remove(&MessageKind::PumpSettings);
    let mut h = Harness::start(script);
    h.advance_to(15.0).await;

    // IoB times out after 3 s, the rest of the cycle still runs
    assert_eq!(h.offsets(MessageKind::CurrentBasalStatus), vec![secs(5.5)]);
    let readings = h.drain();
    let Some(Reading::Basal(basal)) = readings.iter().find(|r| r.name() == "basal") else {
        panic!("expected basal");
    };
    assert_eq!(basal.mode, None);
    assert!(readings.iter().all(|r| r.name() != "iob"));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_battery_falls_back_to_v1() {
    let mut script = full_script();
    script.responses.remove(&MessageKind::CurrentBatteryV2);
    let script = script.respond(MessageKind::CurrentBatteryV1, Bytes::from_static(&[50, 42]));
    let mut h = Harness::start(script);
    h.advance_to(60.0).await;

    assert_eq!(h.offsets(MessageKind::CurrentBatteryV1), vec![secs(48.5)]);
    let readings = h.drain();
    let Some(Reading::Battery(battery)) = readings.iter().find(|r| r.name() == "battery") else {
        panic!("expected battery");
    };
    assert_eq!(battery.percent, 42);
    assert!(!battery.charging);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_low_glucose_raises_one_alert() {
    let script = full_script().respond(MessageKind::CurrentEgv, cgm_cargo(600_000, 62, 1, 0));
    let h = Harness::start(script);
    h.advance_to(100.0).await;

    assert!(h.log.count(MessageKind::CurrentEgv) >= 3);
    assert_eq!(*h.alerts.raised.lock().unwrap(), vec![AlertKind::Low]);
    assert!(h.alerts.cleared.lock().unwrap().is_empty());
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_history_read_once_then_cursor_advances() {
    let records = vec![
        (1, bolus_record(1, 1_000, 1_500)),
        (2, bolus_record(2, 2_000, 30_000)),
        (3, bolus_record(3, 3_000, 2_000)),
    ];
    let script = full_script()
        .respond(MessageKind::HistoryLogStatus, history_status_cargo(3, 1, 3))
        .with_history(records);
    let mut h = Harness::start(script);
    h.advance_to(400.0).await;

    assert_eq!(h.log.count(MessageKind::HistoryLogStatus), 2);
    assert_eq!(h.log.count(MessageKind::HistoryLog), 1);

    let readings = h.drain();
    let history = readings.iter().filter(|r| r.name() == "history_record").count();
    assert_eq!(history, 3);
    // 30 U exceeds the bolus ceiling
    let history_boluses: Vec<u16> = readings
        .iter()
        .filter_map(|r| match r {
            Reading::Bolus(b) if b.bolus_id != 42 => Some(b.bolus_id),
            _ => None,
        })
        .collect();
    assert_eq!(history_boluses, vec![1, 3]);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_disconnected() {
    let h = Harness::start(full_script());
    h.connection.send_replace(ConnectionState::Disconnected);
    sleep(Duration::from_secs(1)).await;
    h.stop().await;
}

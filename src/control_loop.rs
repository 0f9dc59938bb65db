use crate::config::{LinkCredentials, LoopConfig};
use crate::energy_accumulator::EnergyAccumulator;
use crate::error::{RemoteError, SensorError};
use crate::network_link::{LinkStatus, NetworkLink};
use crate::operator::OperatorCommand;
use crate::relay_bank::RelayBank;
use crate::remote_sync::{PullReport, PushOutcome, RemoteStore, RemoteSync, SyncSnapshot};
use crate::sensor_reader::{PowerMeter, SensorReader};
use embedded_hal::digital::OutputPin;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// Connectivity bookkeeping that drives the reconnection policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionHealth {
    pub wifi_connected: bool,
    pub remote_ready: bool,
    pub consecutive_remote_failures: u32,
    /// Re-initialization windows that failed back to back; drives the link restart
    pub failed_reinit_windows: u32,
    pub last_remote_attempt_ms: u64,
}

impl ConnectionHealth {
    fn record_success(&mut self) {
        self.consecutive_remote_failures = 0;
        self.failed_reinit_windows = 0;
    }

    fn record_failures(&mut self, count: usize) {
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        self.consecutive_remote_failures = self.consecutive_remote_failures.saturating_add(count);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    Sent(PushOutcome),
    SensorFailed(SensorError),
    PushFailed(RemoteError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Link was down; a reconnect was attempted and nothing else ran
    LinkDown,
    /// Remote was ready; control state was pulled and telemetry sent if due
    Synced {
        pull: PullReport,
        send: Option<SendResult>,
    },
    /// Remote was not ready
    RemoteUnready {
        reinit_attempted: bool,
        link_restarted: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub command: Option<OperatorCommand>,
    /// How long the scheduler waits before the next step
    pub next_delay: Duration,
}

/// Owns every piece of device state and runs one polling cycle per `step`.
///
/// `step` takes loop time in milliseconds since boot and never sleeps on its
/// own apart from the settle pause of a link restart; the delays of a cycle
/// are handed back to the caller in [`CycleReport::next_delay`].
pub struct ControlLoop<M, S, L, P> {
    timing: LoopConfig,
    credentials: LinkCredentials,
    sensor: SensorReader<M>,
    energy: EnergyAccumulator,
    relays: RelayBank<P>,
    sync: RemoteSync<S>,
    link: L,
    health: ConnectionHealth,
    commands: Receiver<OperatorCommand>,
    last_push_ms: Option<u64>,
}

impl<M, S, L, P> ControlLoop<M, S, L, P>
where
    M: PowerMeter,
    S: RemoteStore,
    L: NetworkLink,
    P: OutputPin,
{
    pub fn new(
        timing: LoopConfig,
        credentials: LinkCredentials,
        sensor: SensorReader<M>,
        relays: RelayBank<P>,
        sync: RemoteSync<S>,
        link: L,
        commands: Receiver<OperatorCommand>,
    ) -> Self {
        Self {
            timing,
            credentials,
            sensor,
            energy: EnergyAccumulator::new(),
            relays,
            sync,
            link,
            health: ConnectionHealth::default(),
            commands,
            last_push_ms: None,
        }
    }

    /// Runs cycles forever, pacing them with the delays each step reports
    pub async fn run(&mut self) {
        let boot = Instant::now();
        loop {
            let now_ms = u64::try_from(boot.elapsed().as_millis()).unwrap_or(u64::MAX);
            let report = self.step(now_ms).await;
            sleep(report.next_delay).await;
        }
    }

    pub async fn step(&mut self, now_ms: u64) -> CycleReport {
        self.health.wifi_connected = self.link.status() == LinkStatus::Connected;
        if !self.health.wifi_connected {
            warn!("Network link disconnected, attempting reconnection");
            if let Err(e) = self.link.connect(&self.credentials).await {
                warn!("Reconnection failed: {}", e);
            }
            return CycleReport {
                outcome: CycleOutcome::LinkDown,
                command: None,
                next_delay: self.timing.link_backoff,
            };
        }

        self.health.remote_ready = self.sync.is_ready();
        let (outcome, next_delay) = if self.health.remote_ready {
            (self.sync_cycle(now_ms).await, self.timing.pacing)
        } else {
            (
                self.recover_remote(now_ms).await,
                self.timing.remote_unready_delay + self.timing.pacing,
            )
        };

        CycleReport {
            outcome,
            command: self.drain_command(),
            next_delay,
        }
    }

    async fn sync_cycle(&mut self, now_ms: u64) -> CycleOutcome {
        // Commands first so a push in the same cycle reflects them
        let pull = self.sync.pull(&mut self.relays).await;
        match pull.failures() {
            0 => self.health.record_success(),
            failures => {
                self.health.record_failures(failures);
                warn!(
                    failures = self.health.consecutive_remote_failures,
                    "Control state sync incomplete"
                );
            }
        }

        let due = self
            .last_push_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.timing.send_interval_ms);
        let send = if due {
            Some(self.send(now_ms).await)
        } else {
            None
        };

        CycleOutcome::Synced { pull, send }
    }

    async fn send(&mut self, now_ms: u64) -> SendResult {
        let measurement = match self.sensor.read().await {
            Ok(measurement) => measurement,
            Err(e) => {
                error!("Error reading PZEM sensor values: {}", e);
                return SendResult::SensorFailed(e);
            }
        };

        if self.energy.apply_pending_reset() {
            info!("Energy counter reset");
        }
        self.energy.integrate(measurement.power, now_ms);

        let snapshot = SyncSnapshot::new(&measurement, self.energy.session_energy_kwh(), now_ms);
        let result = match self.sync.push(&snapshot).await {
            Ok(outcome) => {
                self.health.record_success();
                self.last_push_ms = Some(now_ms);
                SendResult::Sent(outcome)
            }
            Err(e) => {
                self.health.record_failures(1);
                error!(
                    reason = e.reason(),
                    failures = self.health.consecutive_remote_failures,
                    "Firebase upload failed"
                );
                SendResult::PushFailed(e)
            }
        };

        info!(
            "V: {:.1}V | I: {:.3}A | P: {:.2}W | PF: {:.2} | Freq: {:.1}Hz | E: {:.3}Wh",
            measurement.voltage,
            measurement.current,
            measurement.power,
            measurement.power_factor,
            measurement.frequency,
            self.energy.session_energy_wh()
        );
        result
    }

    /// Re-initializes the remote store at most once per retry window and
    /// restarts the link after too many failed windows
    async fn recover_remote(&mut self, now_ms: u64) -> CycleOutcome {
        if now_ms.saturating_sub(self.health.last_remote_attempt_ms) < self.timing.remote_retry_ms {
            return CycleOutcome::RemoteUnready {
                reinit_attempted: false,
                link_restarted: false,
            };
        }

        warn!("Firebase not ready, attempting reconnection");
        self.health.last_remote_attempt_ms = now_ms;
        let link_restarted = match self.sync.begin().await {
            Ok(()) => {
                info!("Firebase re-initialized");
                self.health.remote_ready = true;
                self.health.record_success();
                false
            }
            Err(e) => {
                self.health.record_failures(1);
                self.health.failed_reinit_windows += 1;
                warn!(
                    reason = e.reason(),
                    windows = self.health.failed_reinit_windows,
                    "Firebase re-initialization failed"
                );
                self.health.failed_reinit_windows >= self.timing.max_remote_failures
            }
        };
        if link_restarted {
            self.restart_link().await;
        }

        CycleOutcome::RemoteUnready {
            reinit_attempted: true,
            link_restarted,
        }
    }

    async fn restart_link(&mut self) {
        warn!("Firebase connection failed multiple times, restarting network link");
        self.link.disconnect().await;
        sleep(self.timing.link_restart_settle).await;
        if let Err(e) = self.link.connect(&self.credentials).await {
            warn!("Network link restart failed: {}", e);
        }
        self.health.wifi_connected = self.link.status() == LinkStatus::Connected;
        self.health.record_success();
    }

    /// Applies at most one queued operator command
    fn drain_command(&mut self) -> Option<OperatorCommand> {
        let command = self.commands.try_recv().ok()?;
        match command {
            OperatorCommand::ResetEnergy => {
                self.energy.request_reset();
                info!("Energy counter reset requested");
            }
        }
        Some(command)
    }

    pub fn health(&self) -> &ConnectionHealth {
        &self.health
    }

    pub fn energy(&self) -> &EnergyAccumulator {
        &self.energy
    }

    pub fn relays(&self) -> &RelayBank<P> {
        &self.relays
    }

    pub fn sync(&self) -> &RemoteSync<S> {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut RemoteSync<S> {
        &mut self.sync
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn sensor_mut(&mut self) -> &mut SensorReader<M> {
        &mut self.sensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::relay_bank::{LatchedPin, RELAY_COUNT};
    use crate::remote_sync::tests::MemoryStore;
    use crate::remote_sync::{LIVE_PATH, MAIN_POWER_PATH};
    use crate::sensor_reader::tests::{ScriptedMeter, NOMINAL};
    use async_trait::async_trait;
    use tokio::sync::mpsc::{self, Sender};

    const HOUR_MS: u64 = 3_600_000;

    #[derive(Debug)]
    struct FakeLink {
        status: LinkStatus,
        connect_succeeds: bool,
        connects: usize,
        disconnects: usize,
    }

    impl FakeLink {
        fn up() -> Self {
            Self {
                status: LinkStatus::Connected,
                connect_succeeds: true,
                connects: 0,
                disconnects: 0,
            }
        }
    }

    #[async_trait]
    impl NetworkLink for FakeLink {
        async fn connect(&mut self, _credentials: &LinkCredentials) -> Result<(), LinkError> {
            self.connects += 1;
            if self.connect_succeeds {
                self.status = LinkStatus::Connected;
                Ok(())
            } else {
                Err(LinkError::Disconnected("no access point".to_string()))
            }
        }

        fn status(&self) -> LinkStatus {
            self.status
        }

        async fn disconnect(&mut self) {
            self.disconnects += 1;
            self.status = LinkStatus::Disconnected;
        }
    }

    type TestLoop = ControlLoop<ScriptedMeter, MemoryStore, FakeLink, LatchedPin>;

    fn control_loop(
        polls: Vec<[f32; 6]>,
        store: MemoryStore,
        link: FakeLink,
    ) -> (TestLoop, Sender<OperatorCommand>) {
        let (tx, rx) = mpsc::channel(8);
        let timing = LoopConfig {
            link_restart_settle: Duration::ZERO,
            ..LoopConfig::default()
        };
        let relays = RelayBank::new([27, 26, 25, 33].map(LatchedPin::new)).unwrap();
        let ctl = ControlLoop::new(
            timing,
            LinkCredentials::default(),
            SensorReader::new(ScriptedMeter::with_polls(polls)),
            relays,
            RemoteSync::new(store),
            link,
            rx,
        );
        (ctl, tx)
    }

    fn unready_store() -> MemoryStore {
        MemoryStore {
            ready: false,
            begin_succeeds: false,
            ..MemoryStore::default()
        }
    }

    #[tokio::test]
    async fn test_link_down_skips_everything() {
        let mut link = FakeLink::up();
        link.status = LinkStatus::Disconnected;
        link.connect_succeeds = false;
        let (mut ctl, tx) = control_loop(vec![NOMINAL], MemoryStore::ready(), link);
        tx.send(OperatorCommand::ResetEnergy).await.unwrap();

        let report = ctl.step(0).await;
        assert_eq!(report.outcome, CycleOutcome::LinkDown);
        assert_eq!(report.next_delay, Duration::from_secs(5));
        assert_eq!(report.command, None);
        assert_eq!(ctl.link().connects, 1);
        assert_eq!(ctl.sensor_mut().meter_mut().reads, 0);
        assert!(ctl.sync().store().writes.is_empty());
        assert!(!ctl.energy().reset_requested());
    }

    #[tokio::test]
    async fn test_reconnected_link_resumes_next_cycle() {
        let mut link = FakeLink::up();
        link.status = LinkStatus::Disconnected;
        let (mut ctl, _tx) = control_loop(vec![NOMINAL], MemoryStore::ready(), link);

        assert_eq!(ctl.step(0).await.outcome, CycleOutcome::LinkDown);
        let report = ctl.step(5000).await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Synced {
                send: Some(SendResult::Sent(_)),
                ..
            }
        ));
        assert_eq!(report.next_delay, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_one_hour_at_460w_through_the_loop() {
        let (mut ctl, _tx) =
            control_loop(vec![NOMINAL, NOMINAL], MemoryStore::ready(), FakeLink::up());

        ctl.step(0).await;
        assert_eq!(ctl.energy().session_energy_wh(), 0.0);
        ctl.step(HOUR_MS).await;

        assert!((ctl.energy().session_energy_wh() - 460.0).abs() < 1e-9);
        let live = &ctl.sync().store().values[LIVE_PATH];
        assert_eq!(live["energy"], serde_json::json!(0.46));
        assert_eq!(live["timestamp"], serde_json::json!(HOUR_MS));
        assert!(ctl.sync().store().values.contains_key("/history/3600"));
    }

    #[tokio::test]
    async fn test_invalid_reading_skips_integration_and_push() {
        let (mut ctl, _tx) =
            control_loop(vec![[f32::NAN; 6]], MemoryStore::ready(), FakeLink::up());

        let report = ctl.step(0).await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Synced {
                send: Some(SendResult::SensorFailed(SensorError::InvalidReading { .. })),
                ..
            }
        ));
        assert!(ctl.sync().store().writes.is_empty());
        assert_eq!(ctl.energy().last_measurement_ms(), None);
        assert_eq!(ctl.energy().session_energy_wh(), 0.0);
    }

    #[tokio::test]
    async fn test_sensor_failure_retries_next_cycle() {
        let (mut ctl, _tx) = control_loop(
            vec![[f32::NAN; 6], NOMINAL],
            MemoryStore::ready(),
            FakeLink::up(),
        );

        ctl.step(0).await;
        let report = ctl.step(50).await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Synced {
                send: Some(SendResult::Sent(_)),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_push_spacing() {
        let polls = vec![NOMINAL; 3];
        let (mut ctl, _tx) = control_loop(polls, MemoryStore::ready(), FakeLink::up());

        let sent = |report: &CycleReport| {
            matches!(
                report.outcome,
                CycleOutcome::Synced {
                    send: Some(SendResult::Sent(_)),
                    ..
                }
            )
        };
        assert!(sent(&ctl.step(0).await));
        assert!(!sent(&ctl.step(500).await));
        assert!(!sent(&ctl.step(999).await));
        assert!(sent(&ctl.step(1000).await));
        assert!(sent(&ctl.step(2050).await));
    }

    #[tokio::test]
    async fn test_pull_happens_before_push() {
        let store = MemoryStore::ready().with_bool(MAIN_POWER_PATH, true);
        let (mut ctl, _tx) = control_loop(vec![NOMINAL], store, FakeLink::up());

        let report = ctl.step(0).await;
        let CycleOutcome::Synced { pull, .. } = report.outcome else {
            panic!("expected a synced cycle");
        };
        assert_eq!(pull.main_power, Some(true));
        assert_eq!(ctl.relays().states(), [true; RELAY_COUNT]);

        let writes = &ctl.sync().store().writes;
        assert_eq!(
            writes,
            &vec![
                "/control/relay1",
                "/control/relay2",
                "/control/relay3",
                "/control/relay4",
                "/sensor_data",
                "/history/0"
            ]
        );
    }

    #[tokio::test]
    async fn test_unready_remote_restarts_link_after_five_windows() {
        let (mut ctl, _tx) = control_loop(vec![], unready_store(), FakeLink::up());

        let mut attempts_before_restart = 0;
        let mut restarts = Vec::new();
        for now in (0..=51_000u64).step_by(1000) {
            let report = ctl.step(now).await;
            assert_eq!(report.next_delay, Duration::from_millis(1050));
            if let CycleOutcome::RemoteUnready {
                reinit_attempted,
                link_restarted,
            } = report.outcome
            {
                if reinit_attempted && restarts.is_empty() {
                    attempts_before_restart += 1;
                }
                if link_restarted {
                    restarts.push(now);
                }
            } else {
                panic!("remote should stay unready");
            }
        }

        assert_eq!(attempts_before_restart, 5);
        assert_eq!(restarts, vec![50_000]);
        assert_eq!(ctl.sync().store().begin_calls, 5);
        assert_eq!(ctl.link().disconnects, 1);
        assert_eq!(ctl.link().connects, 1);
        assert_eq!(ctl.health().consecutive_remote_failures, 0);
        assert_eq!(ctl.health().failed_reinit_windows, 0);
        assert_eq!(ctl.health().last_remote_attempt_ms, 50_000);
    }

    #[tokio::test]
    async fn test_restart_needs_five_failed_windows_after_push_failure() {
        let mut store = MemoryStore::ready();
        store.fail_writes.insert("*".to_string());
        store.begin_succeeds = false;
        let (mut ctl, _tx) = control_loop(vec![NOMINAL], store, FakeLink::up());

        ctl.step(0).await;
        assert_eq!(ctl.health().consecutive_remote_failures, 1);

        ctl.sync_mut().store_mut().ready = false;
        let mut restarts = Vec::new();
        for now in (1000..=51_000u64).step_by(1000) {
            if let CycleOutcome::RemoteUnready {
                link_restarted: true,
                ..
            } = ctl.step(now).await.outcome
            {
                restarts.push(now);
            }
        }

        assert_eq!(restarts, vec![50_000]);
        assert_eq!(ctl.sync().store().begin_calls, 5);
        assert_eq!(ctl.link().disconnects, 1);
    }

    #[tokio::test]
    async fn test_successful_reinit_resumes_sync() {
        let (mut ctl, _tx) = control_loop(vec![NOMINAL], unready_store(), FakeLink::up());

        ctl.step(10_000).await;
        assert_eq!(ctl.health().consecutive_remote_failures, 1);
        assert_eq!(ctl.health().failed_reinit_windows, 1);

        ctl.sync_mut().store_mut().begin_succeeds = true;
        let report = ctl.step(20_000).await;
        assert_eq!(
            report.outcome,
            CycleOutcome::RemoteUnready {
                reinit_attempted: true,
                link_restarted: false
            }
        );
        assert_eq!(ctl.health().consecutive_remote_failures, 0);
        assert_eq!(ctl.health().failed_reinit_windows, 0);

        let report = ctl.step(20_050).await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Synced {
                send: Some(SendResult::Sent(_)),
                ..
            }
        ));
        assert_eq!(ctl.health().consecutive_remote_failures, 0);
    }

    #[tokio::test]
    async fn test_successful_reinit_never_restarts_link() {
        let mut store = MemoryStore::ready();
        store.fail_writes.insert("*".to_string());
        store.fail_reads.insert("/control/relay1".to_string());
        let (mut ctl, _tx) = control_loop(vec![NOMINAL; 3], store, FakeLink::up());

        for now in [0, 50, 100] {
            ctl.step(now).await;
        }
        // One read and one push failure per cycle
        assert_eq!(ctl.health().consecutive_remote_failures, 6);

        let store = ctl.sync_mut().store_mut();
        store.ready = false;
        store.begin_succeeds = true;
        let report = ctl.step(10_000).await;
        assert_eq!(
            report.outcome,
            CycleOutcome::RemoteUnready {
                reinit_attempted: true,
                link_restarted: false
            }
        );
        assert_eq!(ctl.health().consecutive_remote_failures, 0);
        assert_eq!(ctl.link().disconnects, 0);
        assert!(ctl.health().remote_ready);
    }

    #[tokio::test]
    async fn test_control_read_failures_are_counted() {
        let mut store = MemoryStore::ready();
        store.fail_reads.insert("/control/relay2".to_string());
        store.fail_reads.insert(MAIN_POWER_PATH.to_string());
        let (mut ctl, _tx) = control_loop(vec![[f32::NAN; 6]; 3], store, FakeLink::up());

        ctl.step(0).await;
        assert_eq!(ctl.health().consecutive_remote_failures, 2);
        ctl.step(50).await;
        assert_eq!(ctl.health().consecutive_remote_failures, 4);

        // A clean pull is a successful remote operation
        ctl.sync_mut().store_mut().fail_reads.clear();
        let report = ctl.step(100).await;
        let CycleOutcome::Synced { pull, .. } = report.outcome else {
            panic!("expected a synced cycle");
        };
        assert_eq!(pull.failures(), 0);
        assert_eq!(ctl.health().consecutive_remote_failures, 0);
    }

    #[tokio::test]
    async fn test_failed_push_is_counted_and_retried() {
        let mut store = MemoryStore::ready();
        store.fail_writes.insert("*".to_string());
        let (mut ctl, _tx) = control_loop(vec![NOMINAL, NOMINAL], store, FakeLink::up());

        let report = ctl.step(0).await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Synced {
                send: Some(SendResult::PushFailed(RemoteError::WriteFailed { .. })),
                ..
            }
        ));
        assert_eq!(ctl.health().consecutive_remote_failures, 1);

        ctl.sync_mut().store_mut().fail_writes.clear();
        let report = ctl.step(50).await;
        assert!(matches!(
            report.outcome,
            CycleOutcome::Synced {
                send: Some(SendResult::Sent(_)),
                ..
            }
        ));
        assert_eq!(ctl.health().consecutive_remote_failures, 0);
    }

    #[tokio::test]
    async fn test_reset_command_applies_at_next_integration() {
        let polls = vec![NOMINAL; 3];
        let (mut ctl, tx) = control_loop(polls, MemoryStore::ready(), FakeLink::up());

        ctl.step(0).await;
        ctl.step(HOUR_MS).await;
        assert!((ctl.energy().session_energy_wh() - 460.0).abs() < 1e-9);

        tx.send(OperatorCommand::ResetEnergy).await.unwrap();
        // Not due for a push yet, the command is only queued
        let report = ctl.step(HOUR_MS + 10).await;
        assert_eq!(report.command, Some(OperatorCommand::ResetEnergy));
        assert!(ctl.energy().reset_requested());
        assert!((ctl.energy().session_energy_wh() - 460.0).abs() < 1e-9);

        ctl.step(2 * HOUR_MS).await;
        assert!(!ctl.energy().reset_requested());
        // Zeroed, then the last hour integrated from the kept baseline
        assert!((ctl.energy().session_energy_wh() - 460.0).abs() < 1e-9);
        assert_eq!(
            ctl.sync().store().values[LIVE_PATH]["energy"],
            serde_json::json!(0.46)
        );
    }

    #[tokio::test]
    async fn test_one_command_per_cycle() {
        let (mut ctl, tx) = control_loop(vec![], unready_store(), FakeLink::up());
        tx.send(OperatorCommand::ResetEnergy).await.unwrap();
        tx.send(OperatorCommand::ResetEnergy).await.unwrap();

        assert!(ctl.step(0).await.command.is_some());
        assert!(ctl.step(1).await.command.is_some());
        assert!(ctl.step(2).await.command.is_none());
    }
}

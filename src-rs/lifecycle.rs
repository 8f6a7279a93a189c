//! Standby/active lifecycle around the poll loop, plus the stop signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{PollSettings, Targets};
use crate::detect::PresenceDetector;
use crate::error::ConnectionError;
use crate::frame::FrameSource;
use crate::poll::{baseline_requests, PollExit, PollLoop};
use crate::remote::{Connector, RemoteControl};
use crate::sync::VisibilitySynchronizer;

/// Cloneable handle that requests a stop.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Stop signal observed by every wait in the run loop.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx: Arc::new(tx) }, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleeps for `duration` or until a stop is requested, whichever comes
    /// first. Returns true if stopped.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let sender_gone = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            res = self.rx.wait_for(|stopped| *stopped) => res.is_err(),
        };
        if sender_gone {
            // nobody can stop us any more; finish the wait normally
            tokio::time::sleep(duration).await;
        }
        self.is_triggered()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Standby,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Error,
    Warn,
    Quiet,
}

/// Keeps a mixer that is down for hours from flooding the log: the first
/// three failures are errors, then every twelfth is a warning.
#[derive(Debug, Default)]
pub struct FailureLog {
    consecutive: u32,
}

impl FailureLog {
    pub fn verbosity(attempt: u32) -> Verbosity {
        if attempt <= 3 {
            Verbosity::Error
        } else if attempt % 12 == 0 {
            Verbosity::Warn
        } else {
            Verbosity::Quiet
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn record(&mut self, err: &ConnectionError, url: &str) {
        self.consecutive += 1;
        let attempt = self.consecutive;
        match Self::verbosity(attempt) {
            Verbosity::Error => error!(error = %err, url, attempt, "failed to reach OBS"),
            Verbosity::Warn => warn!(error = %err, url, attempt, "OBS still unreachable"),
            Verbosity::Quiet => debug!(error = %err, url, attempt, "OBS unreachable"),
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

pub struct ConnectionLifecycleManager<K, S, D> {
    connector: K,
    url: String,
    poll: PollLoop<S, D>,
    targets: Targets,
    standby_interval: Duration,
    synchronizer: VisibilitySynchronizer,
    failures: FailureLog,
    state: LifecycleState,
}

impl<K, S, D> ConnectionLifecycleManager<K, S, D>
where
    K: Connector,
    S: FrameSource,
    D: PresenceDetector,
{
    pub fn new(
        connector: K,
        url: impl Into<String>,
        settings: &PollSettings,
        targets: Targets,
        poll: PollLoop<S, D>,
    ) -> Self {
        Self {
            connector,
            url: url.into(),
            poll,
            targets,
            standby_interval: settings.standby_interval,
            synchronizer: VisibilitySynchronizer,
            failures: FailureLog::default(),
            state: LifecycleState::Standby,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn poll(&self) -> &PollLoop<S, D> {
        &self.poll
    }

    /// Alternates between standby and active until `shutdown` fires.
    ///
    /// Losing the mixer puts every target back to its "no presence" baseline
    /// before returning to standby. A user stop leaves visibility as is.
    pub async fn run(&mut self, mut shutdown: Shutdown) {
        info!(url = %self.url, "presence switch started");
        loop {
            self.state = LifecycleState::Standby;
            let Some(mut client) = self.standby(&mut shutdown).await else {
                break;
            };

            self.state = LifecycleState::Active;
            match self.poll.run(&mut client, &mut shutdown).await {
                PollExit::Stopped => {
                    client.disconnect().await;
                    break;
                }
                PollExit::ConnectionLost(err) => {
                    warn!(error = %err, "OBS lost; returning to standby");
                    self.restore_baseline(&mut client).await;
                    client.disconnect().await;
                    self.state = LifecycleState::Standby;
                    // OBS may still answer while capture keeps failing
                    if shutdown.sleep(self.standby_interval).await {
                        break;
                    }
                }
            }
        }
        self.state = LifecycleState::Standby;
        info!("presence switch stopped");
    }

    /// Connects and probes until the mixer answers. `None` means stopped.
    async fn standby(&mut self, shutdown: &mut Shutdown) -> Option<K::Client> {
        if self.failures.consecutive() == 0 {
            info!(url = %self.url, "standby: waiting for OBS");
        }
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            match self.connect_and_probe().await {
                Ok(client) => {
                    if self.failures.consecutive() > 0 {
                        info!(attempts = self.failures.consecutive(), "OBS reachable again");
                    }
                    self.failures.reset();
                    return Some(client);
                }
                Err(err) => self.failures.record(&err, &self.url),
            }
            if shutdown.sleep(self.standby_interval).await {
                return None;
            }
        }
    }

    async fn connect_and_probe(&mut self) -> Result<K::Client, ConnectionError> {
        let mut client = self.connector.connect().await?;
        match client.get_version().await {
            Ok(version) => {
                info!(
                    obs = %version.obs_version,
                    websocket = %version.websocket_version,
                    "connected to OBS"
                );
                Ok(client)
            }
            Err(err) => {
                client.disconnect().await;
                Err(err)
            }
        }
    }

    async fn restore_baseline(&mut self, client: &mut K::Client) {
        for request in baseline_requests(&self.targets) {
            match self.synchronizer.synchronize(client, &request).await {
                Ok(outcome) => debug!(
                    source = %request.target_source_name,
                    scenes = outcome.scenes_modified,
                    "baseline restored"
                ),
                Err(err) => debug!(
                    source = %request.target_source_name,
                    error = %err,
                    "baseline not restored"
                ),
            }
        }
        self.poll.reset_presence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::Presence;
    use crate::testing::{Call, MockConnector, ScriptedDetector, ScriptedSource, SharedWorld, World};
    use tokio::time::Instant;

    fn poll_settings(max_errors: u32) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(500),
            standby_interval: Duration::from_secs(5),
            max_consecutive_errors: max_errors,
        }
    }

    fn targets() -> Targets {
        Targets {
            show: Some("Overlay".to_string()),
            hide: Some("Idle".to_string()),
            detection_scenes: ["Monitor".to_string()].into_iter().collect(),
        }
    }

    fn manager(
        world: &SharedWorld,
        source: ScriptedSource,
        detector: ScriptedDetector,
        max_errors: u32,
    ) -> ConnectionLifecycleManager<MockConnector, ScriptedSource, ScriptedDetector> {
        let settings = poll_settings(max_errors);
        let poll = PollLoop::new(settings.clone(), targets(), source, detector);
        ConnectionLifecycleManager::new(
            MockConnector {
                world: Arc::clone(world),
            },
            "ws://mock:4455",
            &settings,
            targets(),
            poll,
        )
    }

    #[test]
    fn failure_logging_is_throttled() {
        let levels: Vec<Verbosity> = (1..=25).map(FailureLog::verbosity).collect();
        assert_eq!(&levels[..3], &[Verbosity::Error; 3]);
        assert_eq!(levels[3], Verbosity::Quiet);
        assert_eq!(levels[11], Verbosity::Warn);
        assert_eq!(levels[23], Verbosity::Warn);
        assert_eq!(
            levels.iter().filter(|v| **v == Verbosity::Warn).count(),
            2
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_ends_early_on_stop() {
        let (trigger, mut shutdown) = shutdown_channel();
        let started = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });
        assert!(shutdown.sleep(Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_full_duration_without_stop() {
        let (_trigger, mut shutdown) = shutdown_channel();
        let started = Instant::now();
        assert!(!shutdown.sleep(Duration::from_secs(3)).await);
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_standby_returns() {
        let world = World::with_scenes(&[("Main", &["Overlay", "Idle"])]);
        let (trigger, shutdown) = shutdown_channel();
        {
            let mut w = world.lock().unwrap();
            w.refuse_connections = usize::MAX;
            w.stop_at_connect_attempt = Some(3);
            w.trigger = Some(trigger);
        }
        let mut mgr = manager(&world, ScriptedSource::default(), ScriptedDetector::new(&[true]), 5);

        mgr.run(shutdown).await;

        let w = world.lock().unwrap();
        assert_eq!(w.connect_attempts, 3);
        assert!(w.sets().is_empty());
        assert_eq!(mgr.state(), LifecycleState::Standby);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_mixer_gets_reset_attempt_then_standby() {
        let world = World::with_scenes(&[("Monitor", &["Overlay", "Idle"]), ("Main", &["Overlay", "Idle"])]);
        let (trigger, shutdown) = shutdown_channel();
        {
            let mut w = world.lock().unwrap();
            w.refuse_connections = 2;
            // standby probe plus two poll cycles, then the mixer vanishes
            w.probes_before_offline = Some(3);
            w.stop_at_connect_attempt = Some(4);
            w.trigger = Some(trigger);
        }
        let mut mgr = manager(&world, ScriptedSource::default(), ScriptedDetector::new(&[true]), 5);

        mgr.run(shutdown).await;

        let w = world.lock().unwrap();
        assert_eq!(w.connect_attempts, 4);
        assert_eq!(w.enabled("Main", "Overlay"), vec![true]);
        assert_eq!(w.enabled("Main", "Idle"), vec![false]);

        let probes: Vec<usize> = w
            .log
            .iter()
            .enumerate()
            .filter(|(_, call)| **call == Call::GetVersion)
            .map(|(idx, _)| idx)
            .collect();
        // the probe that lost the session is followed by the reset attempt
        let lost_at = probes[probes.len() - 2];
        assert_eq!(
            w.log[lost_at + 1..lost_at + 3],
            [Call::ListScenes, Call::Disconnect]
        );
        assert_eq!(mgr.poll().presence(), Presence::Absent);
        assert_eq!(mgr.state(), LifecycleState::Standby);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_ceiling_restores_baseline_everywhere() {
        let world = World::with_scenes(&[("Monitor", &["Overlay", "Idle"]), ("Main", &["Overlay", "Idle"])]);
        let (trigger, shutdown) = shutdown_channel();
        {
            let mut w = world.lock().unwrap();
            w.set_enabled("Monitor", "Overlay", true);
            w.set_enabled("Main", "Overlay", true);
            w.stop_at_connect_attempt = Some(2);
            w.trigger = Some(trigger);
        }
        let mut mgr = manager(
            &world,
            ScriptedSource::failing_first(100),
            ScriptedDetector::new(&[true]),
            3,
        );

        mgr.run(shutdown).await;

        let w = world.lock().unwrap();
        assert_eq!(w.connect_attempts, 2);
        // the baseline ignores the detection-scene exclusion
        assert_eq!(w.enabled("Monitor", "Overlay"), vec![false]);
        assert_eq!(w.enabled("Main", "Overlay"), vec![false]);
        assert_eq!(w.enabled("Monitor", "Idle"), vec![true]);
        assert_eq!(w.enabled("Main", "Idle"), vec![true]);
        assert_eq!(w.log.last(), Some(&Call::Disconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn lost_sessions_wait_standby_interval_before_reconnecting() {
        let world = World::with_scenes(&[("Main", &["Overlay", "Idle"])]);
        let (trigger, shutdown) = shutdown_channel();
        {
            let mut w = world.lock().unwrap();
            w.stop_at_connect_attempt = Some(4);
            w.trigger = Some(trigger);
        }
        let mut mgr = manager(
            &world,
            ScriptedSource::failing_first(200),
            ScriptedDetector::new(&[true]),
            3,
        );

        let started = Instant::now();
        mgr.run(shutdown).await;

        let w = world.lock().unwrap();
        assert_eq!(w.connect_attempts, 4);
        // three lost sessions, each followed by a full standby wait
        assert!(started.elapsed() >= Duration::from_secs(15));
        let baseline_walks = w.log.iter().filter(|call| **call == Call::ListScenes).count();
        assert_eq!(baseline_walks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn user_stop_skips_reset() {
        let world = World::with_scenes(&[("Main", &["Overlay", "Idle"])]);
        let (trigger, shutdown) = shutdown_channel();
        let mut mgr = manager(&world, ScriptedSource::default(), ScriptedDetector::new(&[true]), 5);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.trigger();
        });
        mgr.run(shutdown).await;
        stopper.await.unwrap();

        let w = world.lock().unwrap();
        assert_eq!(w.connect_attempts, 1);
        assert_eq!(w.enabled("Main", "Overlay"), vec![true]);
        assert_eq!(w.enabled("Main", "Idle"), vec![false]);
        assert_eq!(w.log.last(), Some(&Call::Disconnect));
        assert_eq!(mgr.poll().presence(), Presence::Present);
    }
}

//! Steady-state cycle while the mixer is reachable: probe, capture,
//! evaluate, apply edges, sleep.

use tracing::{error, info, warn};

use crate::config::{PollSettings, Targets};
use crate::detect::PresenceDetector;
use crate::error::ConnectionError;
use crate::frame::FrameSource;
use crate::lifecycle::Shutdown;
use crate::presence::{Presence, PresenceStateMachine, Transition};
use crate::preview::PreviewWriter;
use crate::remote::RemoteControl;
use crate::sync::{SyncRequest, VisibilitySynchronizer};

/// Why the loop stopped.
#[derive(Debug)]
pub enum PollExit {
    Stopped,
    ConnectionLost(ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    CaptureFailed { consecutive: u32 },
    Evaluated {
        detected: bool,
        transition: Option<Transition>,
    },
}

/// Synchronization requests for one edge, in application order.
///
/// The show-target is hidden everywhere except the detection scenes, so the
/// monitored source stays visible where it is being watched. Showing never
/// excludes anything.
pub fn transition_requests(targets: &Targets, transition: Transition) -> Vec<SyncRequest> {
    let mut requests = Vec::new();
    match transition {
        Transition::Arrived => {
            if let Some(show) = &targets.show {
                requests.push(SyncRequest::new(show, true));
            }
            if let Some(hide) = &targets.hide {
                requests.push(SyncRequest::new(hide, false));
            }
        }
        Transition::Departed => {
            if let Some(show) = &targets.show {
                requests.push(
                    SyncRequest::new(show, false).excluding(targets.detection_scenes.iter().cloned()),
                );
            }
            if let Some(hide) = &targets.hide {
                requests.push(SyncRequest::new(hide, true));
            }
        }
    }
    requests
}

/// The "no presence" baseline applied everywhere when a session ends.
pub fn baseline_requests(targets: &Targets) -> Vec<SyncRequest> {
    let mut requests = Vec::new();
    if let Some(show) = &targets.show {
        requests.push(SyncRequest::new(show, false));
    }
    if let Some(hide) = &targets.hide {
        requests.push(SyncRequest::new(hide, true));
    }
    requests
}

pub struct PollLoop<S, D> {
    settings: PollSettings,
    targets: Targets,
    source: S,
    detector: D,
    presence: PresenceStateMachine,
    synchronizer: VisibilitySynchronizer,
    preview: Option<PreviewWriter>,
    consecutive_errors: u32,
}

impl<S: FrameSource, D: PresenceDetector> PollLoop<S, D> {
    pub fn new(settings: PollSettings, targets: Targets, source: S, detector: D) -> Self {
        Self {
            settings,
            targets,
            source,
            detector,
            presence: PresenceStateMachine::new(),
            synchronizer: VisibilitySynchronizer,
            preview: None,
            consecutive_errors: 0,
        }
    }

    pub fn with_preview(mut self, preview: Option<PreviewWriter>) -> Self {
        self.preview = preview;
        self
    }

    pub fn presence(&self) -> Presence {
        self.presence.current()
    }

    pub fn reset_presence(&mut self) {
        self.presence.reset();
    }

    /// Runs cycles until stopped or the remote becomes unusable. Presence
    /// starts `Absent` for every session.
    pub async fn run<C: RemoteControl>(&mut self, remote: &mut C, shutdown: &mut Shutdown) -> PollExit {
        self.presence.reset();
        self.consecutive_errors = 0;
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            show = self.targets.show.as_deref().unwrap_or("-"),
            hide = self.targets.hide.as_deref().unwrap_or("-"),
            "active: presence detection enabled"
        );

        loop {
            if shutdown.is_triggered() {
                return PollExit::Stopped;
            }
            if let Err(err) = self.cycle(remote).await {
                return PollExit::ConnectionLost(err);
            }
            if shutdown.sleep(self.settings.interval).await {
                return PollExit::Stopped;
            }
        }
    }

    /// One poll cycle. An error means the session can no longer continue.
    pub async fn cycle<C: RemoteControl>(&mut self, remote: &mut C) -> Result<CycleOutcome, ConnectionError> {
        remote.get_version().await?;

        let frame = match self.source.capture(remote).await {
            Ok(frame) => frame,
            Err(err) => {
                self.consecutive_errors += 1;
                let max = self.settings.max_consecutive_errors;
                if self.consecutive_errors >= max {
                    error!(error = %err, failures = self.consecutive_errors, "too many consecutive capture errors");
                    return Err(ConnectionError::CaptureCeiling {
                        failures: self.consecutive_errors,
                        last: err,
                    });
                }
                warn!(error = %err, attempt = self.consecutive_errors, max, "failed to acquire frame");
                return Ok(CycleOutcome::CaptureFailed {
                    consecutive: self.consecutive_errors,
                });
            }
        };
        self.consecutive_errors = 0;

        let detected = self.detector.evaluate(&frame).await;
        let transition = self.presence.observe_at(detected, frame.captured_at);
        if let Some(transition) = transition {
            match transition {
                Transition::Arrived => info!("presence detected"),
                Transition::Departed => info!("presence gone"),
            }
            for request in transition_requests(&self.targets, transition) {
                self.synchronizer.synchronize(remote, &request).await?;
            }
        }

        if let Some(preview) = &self.preview {
            preview.update(&frame, self.presence.current());
        }

        Ok(CycleOutcome::Evaluated {
            detected,
            transition,
        })
    }
}

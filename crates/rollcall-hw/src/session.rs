//! Per-camera connection lifecycle.
//!
//! A session owns at most one capture handle. Failures never escape as
//! panics; they move the session back to `Disconnected` (or `Degraded` after
//! repeated connect failures) and the caller retries after [`SessionPolicy::reconnect_backoff`].

use crate::camera::{CameraError, CameraSource, Capture, Connector};
use crate::frame::Frame;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connect has failed `degraded_after` times in a row. Retries continue.
    Degraded,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub reconnect_backoff: Duration,
    pub health_check_interval: Duration,
    pub degraded_after: u32,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            degraded_after: 3,
        }
    }
}

pub struct CameraSession {
    source: CameraSource,
    connector: Box<dyn Connector>,
    policy: SessionPolicy,
    handle: Option<Box<dyn Capture>>,
    state: SessionState,
    consecutive_failures: u32,
    last_health_check: Option<Instant>,
}

impl CameraSession {
    pub fn new(source: CameraSource, connector: Box<dyn Connector>, policy: SessionPolicy) -> Self {
        Self {
            source,
            connector,
            policy,
            handle: None,
            state: SessionState::Disconnected,
            consecutive_failures: 0,
            last_health_check: None,
        }
    }

    pub fn source(&self) -> &CameraSource {
        &self.source
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn backoff(&self) -> Duration {
        self.policy.reconnect_backoff
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Make sure a usable handle is held.
    ///
    /// While connected, the handle is probed once per health-check interval;
    /// a failed probe releases it. While disconnected, one connect attempt
    /// is made. On `Err` the caller should wait [`Self::backoff`] before
    /// calling again.
    pub fn ensure_connected(&mut self, now: Instant) -> Result<(), CameraError> {
        if let Some(handle) = self.handle.as_mut() {
            let due = self
                .last_health_check
                .map_or(true, |at| now.saturating_duration_since(at) >= self.policy.health_check_interval);
            if !due {
                return Ok(());
            }
            self.last_health_check = Some(now);
            if handle.check_health() {
                return Ok(());
            }
            tracing::warn!(source = %self.source, "health check failed, releasing camera");
            self.release();
            return Err(CameraError::HealthCheckFailed);
        }

        self.state = SessionState::Connecting;
        match self.connector.connect(&self.source) {
            Ok(handle) => {
                if self.consecutive_failures > 0 {
                    tracing::info!(source = %self.source, attempts = self.consecutive_failures + 1, "camera reconnected");
                }
                self.handle = Some(handle);
                self.state = SessionState::Connected;
                self.consecutive_failures = 0;
                self.last_health_check = Some(now);
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.state = if self.consecutive_failures >= self.policy.degraded_after {
                    SessionState::Degraded
                } else {
                    SessionState::Disconnected
                };
                tracing::warn!(
                    source = %self.source,
                    error = %e,
                    failures = self.consecutive_failures,
                    state = ?self.state,
                    "camera connect failed"
                );
                Err(e)
            }
        }
    }

    /// Read one frame from the held handle.
    ///
    /// A non-transient error releases the handle so the next
    /// [`Self::ensure_connected`] reconnects.
    pub fn read_frame(&mut self) -> Result<Frame, CameraError> {
        let handle = self.handle.as_mut().ok_or(CameraError::NotConnected)?;
        match handle.read_frame() {
            Ok(frame) => Ok(frame),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                tracing::warn!(source = %self.source, error = %e, "camera read failed, releasing");
                self.release();
                Err(e)
            }
        }
    }

    /// Drop the handle, freeing the device.
    pub fn release(&mut self) {
        self.handle = None;
        self.last_health_check = None;
        self.state = SessionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameError;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    enum Step {
        Frame,
        Corrupt,
        Fail,
    }

    struct ScriptedCapture {
        steps: VecDeque<Step>,
        healthy: Arc<AtomicBool>,
        checks: Arc<AtomicUsize>,
    }

    impl Capture for ScriptedCapture {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            match self.steps.pop_front().unwrap_or(Step::Frame) {
                Step::Frame => Ok(Frame::new(vec![0; 12], 2, 2, 1)),
                Step::Corrupt => Err(FrameError::InvalidLength { expected: 12, actual: 3 }.into()),
                Step::Fail => Err(CameraError::EndOfStream),
            }
        }

        fn check_health(&mut self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }

    /// Fails the first `fail_first` connects, then hands out scripted captures.
    struct FlakyConnector {
        fail_first: usize,
        attempts: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        checks: Arc<AtomicUsize>,
        script: fn() -> VecDeque<Step>,
    }

    impl Connector for FlakyConnector {
        fn connect(&mut self, source: &CameraSource) -> Result<Box<dyn Capture>, CameraError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(CameraError::DeviceNotFound(source.to_string()));
            }
            Ok(Box::new(ScriptedCapture {
                steps: (self.script)(),
                healthy: self.healthy.clone(),
                checks: self.checks.clone(),
            }))
        }
    }

    struct Harness {
        session: CameraSession,
        attempts: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        checks: Arc<AtomicUsize>,
    }

    fn harness(fail_first: usize, script: fn() -> VecDeque<Step>) -> Harness {
        let attempts = Arc::new(AtomicUsize::new(0));
        let healthy = Arc::new(AtomicBool::new(true));
        let checks = Arc::new(AtomicUsize::new(0));
        let connector = FlakyConnector {
            fail_first,
            attempts: attempts.clone(),
            healthy: healthy.clone(),
            checks: checks.clone(),
            script,
        };
        let policy = SessionPolicy {
            reconnect_backoff: Duration::from_millis(1),
            health_check_interval: Duration::from_secs(60),
            degraded_after: 3,
        };
        let session = CameraSession::new(CameraSource::V4l2("/dev/video9".into()), Box::new(connector), policy);
        Harness { session, attempts, healthy, checks }
    }

    fn frames() -> VecDeque<Step> {
        VecDeque::new()
    }

    #[test]
    fn test_starts_disconnected_and_refuses_reads() {
        let mut h = harness(0, frames);
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(matches!(h.session.read_frame(), Err(CameraError::NotConnected)));
    }

    #[test]
    fn test_reconnects_after_failures() {
        let mut h = harness(2, frames);
        let now = Instant::now();

        assert!(h.session.ensure_connected(now).is_err());
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(h.session.ensure_connected(now).is_err());
        assert_eq!(h.session.consecutive_failures(), 2);

        h.session.ensure_connected(now).unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
        assert_eq!(h.session.consecutive_failures(), 0);
        assert!(h.session.read_frame().is_ok());
        assert_eq!(h.attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_degraded_after_threshold_then_recovers() {
        let mut h = harness(4, frames);
        let now = Instant::now();
        for _ in 0..2 {
            let _ = h.session.ensure_connected(now);
        }
        assert_eq!(h.session.state(), SessionState::Disconnected);
        let _ = h.session.ensure_connected(now);
        assert_eq!(h.session.state(), SessionState::Degraded);
        let _ = h.session.ensure_connected(now);
        assert_eq!(h.session.state(), SessionState::Degraded);

        h.session.ensure_connected(now).unwrap();
        assert_eq!(h.session.state(), SessionState::Connected);
    }

    #[test]
    fn test_health_check_only_on_interval() {
        let mut h = harness(0, frames);
        let t0 = Instant::now();
        h.session.ensure_connected(t0).unwrap();

        h.session.ensure_connected(t0 + Duration::from_secs(59)).unwrap();
        assert_eq!(h.checks.load(Ordering::SeqCst), 0);

        h.session.ensure_connected(t0 + Duration::from_secs(60)).unwrap();
        assert_eq!(h.checks.load(Ordering::SeqCst), 1);

        h.healthy.store(false, Ordering::SeqCst);
        let err = h.session.ensure_connected(t0 + Duration::from_secs(120)).unwrap_err();
        assert!(matches!(err, CameraError::HealthCheckFailed));
        assert_eq!(h.session.state(), SessionState::Disconnected);
        assert!(matches!(h.session.read_frame(), Err(CameraError::NotConnected)));
    }

    #[test]
    fn test_read_failure_releases_handle() {
        let mut h = harness(0, || VecDeque::from([Step::Fail]));
        h.session.ensure_connected(Instant::now()).unwrap();
        assert!(matches!(h.session.read_frame(), Err(CameraError::EndOfStream)));
        assert_eq!(h.session.state(), SessionState::Disconnected);

        h.session.ensure_connected(Instant::now()).unwrap();
        assert!(h.session.read_frame().is_ok());
        assert_eq!(h.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_corrupt_frame_keeps_handle() {
        let mut h = harness(0, || VecDeque::from([Step::Corrupt, Step::Frame]));
        h.session.ensure_connected(Instant::now()).unwrap();
        assert!(h.session.read_frame().unwrap_err().is_transient());
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(h.session.read_frame().is_ok());
        assert_eq!(h.attempts.load(Ordering::SeqCst), 1);
    }
}

use crate::pipeline::FramePipeline;
use crate::shutdown::ShutdownSignal;
use crate::status::StatusBoard;
use rollcall_hw::{CameraSession, SessionState};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

/// One camera's capture loop: keep the session connected, read frames in
/// order and feed them to the pipeline. Nothing here is fatal; every error
/// is logged, recorded on the status board and retried.
pub struct CameraWorker {
    id: String,
    session: CameraSession,
    pipeline: FramePipeline,
    status: Arc<StatusBoard>,
    shutdown: ShutdownSignal,
}

impl CameraWorker {
    pub fn new(
        session: CameraSession,
        pipeline: FramePipeline,
        status: Arc<StatusBoard>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let id = pipeline.camera().to_string();
        status.register(&id, &session.source().to_string());
        Self {
            id,
            session,
            pipeline,
            status,
            shutdown,
        }
    }

    fn publish_state(&self) {
        let state = self.session.state();
        let failures = self.session.consecutive_failures();
        self.status.update(&self.id, |s| {
            s.state = state;
            s.consecutive_failures = failures;
        });
    }

    fn record_error(&self, error: &dyn std::fmt::Display) {
        let message = error.to_string();
        self.status.update(&self.id, |s| s.last_error = Some(message));
    }

    pub fn run(mut self) {
        tracing::info!(camera = %self.id, source = %self.session.source(), "camera worker started");

        while !self.shutdown.is_triggered() {
            let was_connected = self.session.state() == SessionState::Connected;
            if let Err(e) = self.session.ensure_connected(Instant::now()) {
                self.publish_state();
                self.record_error(&e);
                if self.shutdown.wait_timeout(self.session.backoff()) {
                    break;
                }
                continue;
            }
            if !was_connected {
                tracing::info!(camera = %self.id, "camera connected");
                self.publish_state();
            }

            let frame = match self.session.read_frame() {
                Ok(frame) => frame,
                Err(e) if e.is_transient() => {
                    tracing::warn!(camera = %self.id, error = %e, "dropping bad frame");
                    self.status.update(&self.id, |s| s.frame_errors += 1);
                    continue;
                }
                Err(e) => {
                    self.publish_state();
                    self.record_error(&e);
                    if self.shutdown.wait_timeout(self.session.backoff()) {
                        break;
                    }
                    continue;
                }
            };
            self.status.update(&self.id, |s| s.frames_read += 1);

            match self.pipeline.handle(&frame) {
                Ok(Some(report)) => {
                    let last_event = report.events.last().map(|e| e.occurred_at);
                    self.status.update(&self.id, |s| {
                        s.frames_processed += 1;
                        s.table_generation = report.generation;
                        s.events_emitted += report.events.len() as u64;
                        if last_event.is_some() {
                            s.last_event_at = last_event;
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(camera = %self.id, sequence = frame.sequence, error = %e, "frame processing failed");
                    self.status.update(&self.id, |s| s.frame_errors += 1);
                    self.record_error(&e);
                }
            }
        }

        self.session.release();
        self.publish_state();
        tracing::info!(camera = %self.id, "camera worker stopped");
    }
}

pub fn spawn(worker: CameraWorker) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("rollcall-cam-{}", worker.id))
        .spawn(move || worker.run())
}

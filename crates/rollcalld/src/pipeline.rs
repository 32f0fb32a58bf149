//! Per-camera frame processing: detect, embed, match, dedup, log.

use rollcall_core::{
    AttendanceEvent, CooldownLedger, CosineMatcher, Decision, DetectFaces, DetectorError, EventSink,
    ExtractEmbedding, Matcher, Notification, RgbView, TableSubscriber,
};
use rollcall_hw::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub similarity_threshold: f32,
    pub max_faces: usize,
    pub frame_stride: u32,
}

/// Outcome of one processed frame.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub generation: u64,
    pub faces: usize,
    pub recognized: usize,
    /// Events durably logged for this frame.
    pub events: Vec<AttendanceEvent>,
    pub suppressed: usize,
    pub sink_failures: usize,
    /// Faces skipped because no embedding could be extracted.
    pub embedding_failures: usize,
}

impl FrameReport {
    pub fn recognition_rate(&self) -> f32 {
        if self.faces == 0 {
            0.0
        } else {
            self.recognized as f32 / self.faces as f32
        }
    }
}

pub struct FramePipeline {
    camera: Arc<str>,
    detector: Box<dyn DetectFaces>,
    recognizer: Box<dyn ExtractEmbedding>,
    matcher: CosineMatcher,
    tables: TableSubscriber,
    ledger: Arc<CooldownLedger>,
    sink: Arc<dyn EventSink>,
    notifications: mpsc::UnboundedSender<Notification>,
    settings: PipelineSettings,
    frames_seen: u64,
}

impl FramePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: &str,
        detector: Box<dyn DetectFaces>,
        recognizer: Box<dyn ExtractEmbedding>,
        tables: TableSubscriber,
        ledger: Arc<CooldownLedger>,
        sink: Arc<dyn EventSink>,
        notifications: mpsc::UnboundedSender<Notification>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            camera: Arc::from(camera),
            detector,
            recognizer,
            matcher: CosineMatcher,
            tables,
            ledger,
            sink,
            notifications,
            settings,
            frames_seen: 0,
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Feed one frame. Returns `None` when the stride skips it.
    pub fn handle(&mut self, frame: &Frame) -> Result<Option<FrameReport>, PipelineError> {
        let stride = u64::from(self.settings.frame_stride.max(1));
        let index = self.frames_seen;
        self.frames_seen += 1;
        if index % stride != 0 {
            return Ok(None);
        }
        self.process(frame).map(Some)
    }

    /// Run the full pipeline on `frame`, regardless of stride.
    pub fn process(&mut self, frame: &Frame) -> Result<FrameReport, PipelineError> {
        // Swap tables only here, between frames.
        if let Some(generation) = self.tables.refresh() {
            tracing::info!(camera = %self.camera, generation, "adopted new identity table");
        }
        let table = Arc::clone(self.tables.current());

        let view = RgbView::new(&frame.data, frame.width, frame.height);
        let faces = self.detector.detect_faces(view, self.settings.max_faces)?;
        let mut report = FrameReport {
            generation: table.generation(),
            faces: faces.len(),
            ..FrameReport::default()
        };

        for face in &faces {
            let probe = match self.recognizer.extract_embedding(view, face) {
                Ok(probe) => probe,
                Err(e) => {
                    report.embedding_failures += 1;
                    tracing::warn!(camera = %self.camera, sequence = frame.sequence, error = %e, "skipping face");
                    continue;
                }
            };
            let found = self.matcher.best_match(&probe, &table, self.settings.similarity_threshold);
            let Some(identity) = found.identity else {
                continue;
            };
            report.recognized += 1;

            let key = self.ledger.key(&identity.name, &self.camera);
            match self.ledger.check(key, frame.timestamp) {
                Decision::Emit(claim) => {
                    let event = AttendanceEvent::new(&identity.name, &self.camera, frame.captured_at, found.similarity);
                    match self.sink.log_event(&event) {
                        Ok(()) => {
                            claim.commit();
                            tracing::info!(
                                camera = %self.camera,
                                identity = %identity.name,
                                similarity = found.similarity,
                                event = %event.id,
                                "attendance logged"
                            );
                            if self.notifications.send(event.notification()).is_err() {
                                tracing::debug!(camera = %self.camera, "notification dispatcher gone");
                            }
                            report.events.push(event);
                        }
                        Err(e) => {
                            // Dropping the claim restores the previous entry.
                            drop(claim);
                            report.sink_failures += 1;
                            tracing::warn!(
                                camera = %self.camera,
                                identity = %identity.name,
                                error = %e,
                                "failed to log attendance event"
                            );
                        }
                    }
                }
                Decision::Suppressed { remaining } => {
                    report.suppressed += 1;
                    tracing::debug!(
                        camera = %self.camera,
                        identity = %identity.name,
                        remaining_ms = remaining.as_millis() as u64,
                        "duplicate suppressed"
                    );
                }
                Decision::InFlight => {
                    report.suppressed += 1;
                    tracing::debug!(camera = %self.camera, identity = %identity.name, "event in flight elsewhere");
                }
            }
        }

        tracing::debug!(
            camera = %self.camera,
            sequence = frame.sequence,
            faces = report.faces,
            recognized = report.recognized,
            rate = report.recognition_rate(),
            "frame processed"
        );
        Ok(report)
    }
}

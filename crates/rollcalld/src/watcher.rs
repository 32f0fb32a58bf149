use crate::shutdown::ShutdownSignal;
use rollcall_core::{build_table, fingerprint, DetectFaces, ExtractEmbedding, Fingerprint, TablePublisher};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Unchanged,
    Rebuilt { generation: u64, identities: usize },
    /// Rebuild or fingerprint failed; the live table was kept.
    Failed,
}

/// Polls the enrollment directory and republishes the identity table when it changes.
///
/// Rebuilds run on the watcher's own thread with its own models, so camera
/// workers keep matching against the previous table until the new one lands.
pub struct EnrollmentWatcher {
    dir: PathBuf,
    interval: Duration,
    detector: Box<dyn DetectFaces>,
    recognizer: Box<dyn ExtractEmbedding>,
    publisher: TablePublisher,
    last: Option<Fingerprint>,
}

impl EnrollmentWatcher {
    pub fn new(
        dir: PathBuf,
        interval: Duration,
        detector: Box<dyn DetectFaces>,
        recognizer: Box<dyn ExtractEmbedding>,
        publisher: TablePublisher,
    ) -> Self {
        Self {
            dir,
            interval,
            detector,
            recognizer,
            publisher,
            last: None,
        }
    }

    /// Compare the fingerprint with the last one seen and rebuild on change.
    pub fn poll(&mut self) -> PollOutcome {
        let current = match fingerprint(&self.dir) {
            Ok(fp) => fp,
            Err(e) => {
                if self.last.take().is_some() {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "enrollment directory unavailable; keeping current table");
                }
                return PollOutcome::Failed;
            }
        };
        if self.last.as_ref() == Some(&current) {
            return PollOutcome::Unchanged;
        }

        tracing::info!(
            dir = %self.dir.display(),
            directories = current.directories,
            files = current.files,
            digest = %current.digest_hex(),
            "enrollment change detected, rebuilding"
        );
        let generation = self.publisher.current().generation() + 1;
        // A broken tree stays broken until files change, so remember it either way.
        self.last = Some(current);

        match build_table(&self.dir, self.detector.as_mut(), self.recognizer.as_mut(), generation) {
            Ok(table) => {
                let identities = table.len();
                self.publisher.publish(table);
                tracing::info!(generation, identities, "identity table published");
                PollOutcome::Rebuilt { generation, identities }
            }
            Err(e) => {
                tracing::warn!(error = %e, "enrollment rebuild failed; keeping current table");
                PollOutcome::Failed
            }
        }
    }

    pub fn run(mut self, shutdown: ShutdownSignal) {
        tracing::info!(dir = %self.dir.display(), interval_secs = self.interval.as_secs(), "enrollment watcher started");
        loop {
            self.poll();
            if shutdown.wait_timeout(self.interval) {
                break;
            }
        }
        tracing::info!("enrollment watcher exiting");
    }
}

pub fn spawn(watcher: EnrollmentWatcher, shutdown: ShutdownSignal) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("rollcall-enroll".into())
        .spawn(move || watcher.run(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FramePipeline, PipelineSettings};
    use crate::test_support::*;
    use rollcall_core::{table_channel, CooldownLedger, DedupScope, IdentityTable};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn watcher(dir: PathBuf, publisher: TablePublisher, interval: Duration) -> EnrollmentWatcher {
        EnrollmentWatcher::new(dir, interval, Box::new(ColorDetector), Box::new(ColorRecognizer), publisher)
    }

    #[test]
    fn test_rebuilds_only_on_change() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice", "1.png", RED);
        let (publisher, mut subscriber) = table_channel(IdentityTable::empty());
        let mut w = watcher(dir.path().to_path_buf(), publisher, Duration::from_secs(5));

        assert_eq!(w.poll(), PollOutcome::Rebuilt { generation: 1, identities: 1 });
        assert_eq!(w.poll(), PollOutcome::Unchanged);

        write_face(dir.path(), "dave", "1.png", BLUE);
        assert_eq!(w.poll(), PollOutcome::Rebuilt { generation: 2, identities: 2 });
        assert_eq!(subscriber.refresh(), Some(2));
        assert!(subscriber.current().get("dave").is_some());
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice", "1.png", RED);
        let (publisher, mut subscriber) = table_channel(IdentityTable::empty());
        let mut w = watcher(dir.path().to_path_buf(), publisher, Duration::from_secs(5));
        w.poll();
        subscriber.refresh();

        // Every image now yields no face.
        std::fs::remove_dir_all(dir.path().join("alice")).unwrap();
        write_face(dir.path(), "alice", "dark.png", BLACK);
        assert_eq!(w.poll(), PollOutcome::Failed);
        assert_eq!(subscriber.refresh(), None);
        assert_eq!(subscriber.current().generation(), 1);
        assert!(subscriber.current().get("alice").is_some());

        // Unchanged broken tree is not rebuilt again.
        assert_eq!(w.poll(), PollOutcome::Unchanged);
    }

    #[test]
    fn test_missing_directory_fails_softly() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _subscriber) = table_channel(IdentityTable::empty());
        let mut w = watcher(dir.path().join("absent"), publisher, Duration::from_secs(5));
        assert_eq!(w.poll(), PollOutcome::Failed);
    }

    /// A new identity appears while a camera keeps processing frames: the
    /// probe goes from Unknown to matched and no frame fails in between.
    #[test]
    fn test_hot_reload_while_processing() {
        let dir = tempfile::tempdir().unwrap();
        write_face(dir.path(), "alice", "1.png", RED);

        let (publisher, subscriber) = table_channel(IdentityTable::empty());
        let mut w = watcher(dir.path().to_path_buf(), publisher, Duration::from_millis(20));
        w.poll();

        let shutdown = ShutdownSignal::new();
        let handle = spawn(w, shutdown.clone()).unwrap();

        let sink = Arc::new(MemorySink::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pipeline = FramePipeline::new(
            "cam01",
            Box::new(ColorDetector),
            Box::new(ColorRecognizer),
            subscriber,
            Arc::new(CooldownLedger::new(Duration::from_secs(60), DedupScope::Global)),
            sink.clone(),
            tx,
            PipelineSettings { similarity_threshold: 0.4, max_faces: 0, frame_stride: 1 },
        );

        let report = pipeline.process(&solid_frame(BLUE, Instant::now())).unwrap();
        assert_eq!(report.recognized, 0);

        write_face(dir.path(), "dave", "1.png", BLUE);
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut frames = 0;
        let matched = loop {
            let report = pipeline.process(&solid_frame(BLUE, Instant::now())).unwrap();
            frames += 1;
            if report.recognized == 1 {
                break true;
            }
            if Instant::now() > deadline {
                break false;
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        shutdown.trigger();
        handle.join().unwrap();
        assert!(matched, "dave never matched after {frames} frames");
        assert_eq!(sink.events()[0].identity, "dave");
    }
}

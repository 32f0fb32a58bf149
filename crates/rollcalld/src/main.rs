use anyhow::{Context, Result};
use rollcall_core::{table_channel, CooldownLedger, FaceDetector, FaceRecognizer, IdentityTable, Notifier};
use rollcall_hw::{CameraSession, SystemConnector};
use rollcall_sink::{LogNotifier, SqliteEventStore, TelegramNotifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod notify;
mod pipeline;
mod shutdown;
mod status;
#[cfg(test)]
mod test_support;
mod watcher;
mod worker;

use config::Config;
use dbus_interface::RollcallService;
use pipeline::{FramePipeline, PipelineSettings};
use shutdown::ShutdownSignal;
use status::StatusBoard;
use watcher::{EnrollmentWatcher, PollOutcome};
use worker::CameraWorker;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn load_detector(config: &Config) -> Result<FaceDetector> {
    let path = config.detector_model_path();
    let detector = FaceDetector::load(&path.to_string_lossy(), config.detection_confidence)
        .with_context(|| format!("loading SCRFD detector from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "SCRFD detector loaded");
    Ok(detector)
}

fn load_recognizer(config: &Config) -> Result<FaceRecognizer> {
    let path = config.recognizer_model_path();
    let recognizer = FaceRecognizer::load(&path.to_string_lossy())
        .with_context(|| format!("loading ArcFace recognizer from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "ArcFace recognizer loaded");
    Ok(recognizer)
}

/// Serve status over D-Bus (if enabled) until SIGINT or SIGTERM.
async fn serve(enable_dbus: bool, service: RollcallService) -> Result<()> {
    let _conn = if enable_dbus {
        let built = async {
            zbus::connection::Builder::system()?
                .name(dbus_interface::BUS_NAME)?
                .serve_at(dbus_interface::OBJECT_PATH, service)?
                .build()
                .await
        }
        .await;
        match built {
            Ok(conn) => {
                tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus status interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable; status interface disabled");
                None
            }
        }
    } else {
        None
    };

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    // Everything fatal is checked before any worker starts.
    let config = Config::load().context("invalid configuration")?;
    let cameras = config.camera_sources()?;
    config.check_models()?;

    let store = Arc::new(
        SqliteEventStore::open(&config.db_path)
            .with_context(|| format!("opening attendance store {}", config.db_path.display()))?,
    );
    tracing::info!(
        path = %config.db_path.display(),
        events = store.count().context("reading attendance store")?,
        "attendance store opened"
    );

    let ledger = Arc::new(CooldownLedger::new(config.cooldown(), config.dedup_scope));
    tracing::info!(cooldown_secs = config.cooldown_secs, scope = ?config.dedup_scope, "cooldown ledger ready");

    let notifier: Box<dyn Notifier> = match &config.telegram_token {
        Some(token) => {
            tracing::info!(recipients = %config.telegram_recipients.display(), "Telegram notifications enabled");
            Box::new(TelegramNotifier::new(token, &config.telegram_recipients)?)
        }
        None => {
            tracing::info!("no Telegram token configured; notifications are logged only");
            Box::new(LogNotifier)
        }
    };
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let dispatcher = notify::spawn_dispatcher(notifier, notify_rx)?;

    let shutdown = ShutdownSignal::new();
    let status = Arc::new(StatusBoard::new());

    // The first table is built synchronously so cameras start with it.
    let (publisher, subscriber) = table_channel(IdentityTable::empty());
    let mut watcher = EnrollmentWatcher::new(
        config.enrollment_dir.clone(),
        config.enrollment_poll_interval(),
        Box::new(load_detector(&config)?),
        Box::new(load_recognizer(&config)?),
        publisher,
    );
    match watcher.poll() {
        PollOutcome::Rebuilt { identities, .. } => tracing::info!(identities, "initial identity table ready"),
        _ => tracing::warn!(
            dir = %config.enrollment_dir.display(),
            "no identities enrolled yet; every face will be Unknown until the directory is populated"
        ),
    }
    let watcher_handle = watcher::spawn(watcher, shutdown.clone())?;

    let settings = PipelineSettings {
        similarity_threshold: config.similarity_threshold,
        max_faces: config.max_faces,
        frame_stride: config.frame_stride,
    };
    let stale_after = config.session_policy().health_check_interval.max(CONNECT_TIMEOUT);

    let mut workers = Vec::with_capacity(cameras.len());
    for (id, source) in cameras {
        let connector = SystemConnector::new(CONNECT_TIMEOUT, stale_after)?;
        let session = CameraSession::new(source, Box::new(connector), config.session_policy());
        let pipeline = FramePipeline::new(
            &id,
            Box::new(load_detector(&config)?),
            Box::new(load_recognizer(&config)?),
            subscriber.clone(),
            Arc::clone(&ledger),
            store.clone(),
            notify_tx.clone(),
            settings,
        );
        let worker = CameraWorker::new(session, pipeline, Arc::clone(&status), shutdown.clone());
        workers.push((id, worker::spawn(worker)?));
    }
    // Workers hold the remaining senders; the dispatcher exits once they stop.
    drop(notify_tx);

    tracing::info!(cameras = workers.len(), "rollcalld ready");

    let service = RollcallService::new(Arc::clone(&status), subscriber, Arc::clone(&ledger));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    let served = runtime.block_on(serve(config.dbus, service));

    tracing::info!("rollcalld shutting down");
    shutdown.trigger();
    for (id, handle) in workers {
        if handle.join().is_err() {
            tracing::error!(camera = %id, "camera worker panicked");
        }
    }
    if watcher_handle.join().is_err() {
        tracing::error!("enrollment watcher panicked");
    }
    if dispatcher.join().is_err() {
        tracing::error!("notification dispatcher panicked");
    }
    drop(runtime);

    served
}

use rollcall_core::{Delivery, Notification, Notifier};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Spawn the notification dispatcher on a dedicated OS thread.
///
/// Camera workers only enqueue; slow or failing transports never hold up
/// frame processing. Each notification is attempted once. The thread exits
/// when every sender has been dropped.
pub fn spawn_dispatcher(
    notifier: Box<dyn Notifier>,
    mut rx: mpsc::UnboundedReceiver<Notification>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("rollcall-notify".into())
        .spawn(move || {
            tracing::info!("notification dispatcher started");
            while let Some(notification) = rx.blocking_recv() {
                match notifier.notify(&notification) {
                    Ok(Delivery::Sent) => {}
                    Ok(Delivery::NoRecipient) => {
                        tracing::debug!(identity = %notification.identity, "no recipient registered");
                    }
                    Err(e) => {
                        tracing::warn!(identity = %notification.identity, error = %e, "notification failed");
                    }
                }
            }
            tracing::info!("notification dispatcher exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rollcall_core::NotifyError;
    use std::sync::{Arc, Mutex};

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl Notifier for Recording {
        fn notify(&self, n: &Notification) -> Result<Delivery, NotifyError> {
            self.seen.lock().unwrap().push(n.identity.clone());
            if n.identity == "broken" {
                return Err(NotifyError::Transport("connection reset".into()));
            }
            Ok(Delivery::Sent)
        }
    }

    fn note(identity: &str) -> Notification {
        Notification {
            identity: identity.into(),
            camera_id: "cam01".into(),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_dispatches_in_order_and_survives_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = spawn_dispatcher(Box::new(Recording { seen: seen.clone() }), rx).unwrap();

        for name in ["alice", "broken", "bob"] {
            tx.send(note(name)).unwrap();
        }
        drop(tx);
        handle.join().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["alice", "broken", "bob"]);
    }
}

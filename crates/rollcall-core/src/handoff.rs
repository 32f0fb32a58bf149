//! Single-slot, latest-wins publication of identity tables.
//!
//! The enrollment watcher publishes; every frame pipeline holds a subscriber
//! and swaps its snapshot only between frames. A table published while an
//! older one is still unconsumed simply replaces it.

use crate::types::IdentityTable;
use std::sync::Arc;
use tokio::sync::watch;

/// Create a hand-off seeded with `initial`.
pub fn table_channel(initial: IdentityTable) -> (TablePublisher, TableSubscriber) {
    let initial = Arc::new(initial);
    let (tx, rx) = watch::channel(Arc::clone(&initial));
    (
        TablePublisher { tx },
        TableSubscriber { rx, current: initial },
    )
}

pub struct TablePublisher {
    tx: watch::Sender<Arc<IdentityTable>>,
}

impl TablePublisher {
    /// Replace the live table. Never blocks and never queues.
    pub fn publish(&self, table: IdentityTable) -> Arc<IdentityTable> {
        let table = Arc::new(table);
        self.tx.send_replace(Arc::clone(&table));
        table
    }

    /// The most recently published table.
    pub fn current(&self) -> Arc<IdentityTable> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> TableSubscriber {
        let mut rx = self.tx.subscribe();
        let current = Arc::clone(&rx.borrow_and_update());
        TableSubscriber { rx, current }
    }
}

/// A pipeline's view of the live table.
#[derive(Clone)]
pub struct TableSubscriber {
    rx: watch::Receiver<Arc<IdentityTable>>,
    current: Arc<IdentityTable>,
}

impl TableSubscriber {
    /// Adopt the latest published table, if any arrived since the last call.
    ///
    /// Returns the new generation when a swap happened. A closed publisher
    /// leaves the current snapshot in place.
    pub fn refresh(&mut self) -> Option<u64> {
        if !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        self.current = Arc::clone(&self.rx.borrow_and_update());
        Some(self.current.generation())
    }

    /// Snapshot held for the current frame.
    pub fn current(&self) -> &Arc<IdentityTable> {
        &self.current
    }
}

use crate::status::{CameraStatus, StatusBoard};
use chrono::{DateTime, Utc};
use rollcall_core::{CooldownLedger, DedupScope, TableSubscriber};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub table_generation: u64,
    pub identities: usize,
    pub embeddings: usize,
    pub dedup_scope: DedupScope,
    pub cooldown_secs: u64,
    pub cooldown_entries: usize,
    pub cameras: BTreeMap<String, CameraStatus>,
}

#[derive(Debug, Serialize)]
struct IdentitySummary<'a> {
    name: &'a str,
    embeddings: usize,
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct RollcallService {
    status: Arc<StatusBoard>,
    tables: TableSubscriber,
    ledger: Arc<CooldownLedger>,
    started_at: DateTime<Utc>,
}

impl RollcallService {
    pub fn new(status: Arc<StatusBoard>, tables: TableSubscriber, ledger: Arc<CooldownLedger>) -> Self {
        Self {
            status,
            tables,
            ledger,
            started_at: Utc::now(),
        }
    }

    fn latest_tables(&self) -> TableSubscriber {
        let mut view = self.tables.clone();
        view.refresh();
        view
    }

    pub fn daemon_status(&self) -> DaemonStatus {
        let view = self.latest_tables();
        let table = view.current();
        // Entries past their window are not counted as live suppressions.
        self.ledger.sweep(Instant::now());
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.started_at,
            table_generation: table.generation(),
            identities: table.len(),
            embeddings: table.embedding_count(),
            dedup_scope: self.ledger.scope(),
            cooldown_secs: self.ledger.window().as_secs(),
            cooldown_entries: self.ledger.len(),
            cameras: self.status.snapshot(),
        }
    }

    pub fn identities_json(&self) -> String {
        let view = self.latest_tables();
        let summary: Vec<IdentitySummary<'_>> = view
            .current()
            .identities()
            .iter()
            .map(|i| IdentitySummary { name: &i.name, embeddings: i.embeddings.len() })
            .collect();
        serde_json::to_string(&summary).unwrap_or_else(|_| "[]".into())
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl RollcallService {
    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.daemon_status()).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// List identities in the live table as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        tracing::debug!("list_identities requested");
        Ok(self.identities_json())
    }
}

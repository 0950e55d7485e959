//! Operation Audit Trail
//!
//! Append-only record of every mutating decision: what was attempted, on
//! which targets, with which parameters, by whom, and how it ended. Records
//! are never changed once appended. Each append is fanned out to
//! subscribers, counted in metrics and optionally written as a JSON line.
//! Memory holds only the most recent records; the JSON-line file is the
//! durable trail.

use crate::error::{Error, ErrorClass, Result};
use crate::metrics::ManagerMetrics;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{info, warn};

// =============================================================================
// Record Types
// =============================================================================

/// What an operation record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    CreatePv,
    CreateVg,
    ExtendVg,
    CreateLv,
    ExtendLv,
    CreateSnapshot,
    Backup,
    PruneBackups,
    /// Monitor observed usage above the warning threshold
    UsageWarning,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreatePv => "create-pv",
            OperationKind::CreateVg => "create-vg",
            OperationKind::ExtendVg => "extend-vg",
            OperationKind::CreateLv => "create-lv",
            OperationKind::ExtendLv => "extend-lv",
            OperationKind::CreateSnapshot => "create-snapshot",
            OperationKind::Backup => "backup",
            OperationKind::PruneBackups => "prune-backups",
            OperationKind::UsageWarning => "usage-warning",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an operation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    /// Primary mutation done, a follow-on step failed
    PartialSuccess,
    Failure,
    /// Recorded only, backend never invoked
    DryRun,
    Cancelled,
    Warning,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::PartialSuccess => "partial-success",
            Outcome::Failure => "failure",
            Outcome::DryRun => "dry-run",
            Outcome::Cancelled => "cancelled",
            Outcome::Warning => "warning",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Interactive or CLI-triggered
    Operator,
    /// Usage monitor decision
    Monitor,
    /// Backup schedule
    Scheduler,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Operator => write!(f, "operator"),
            Origin::Monitor => write!(f, "monitor"),
            Origin::Scheduler => write!(f, "scheduler"),
        }
    }
}

/// One audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Monotonically increasing, assigned on append
    pub id: u64,
    pub kind: OperationKind,
    pub targets: Vec<String>,
    /// Requested parameters, in insertion order
    pub parameters: IndexMap<String, serde_json::Value>,
    pub origin: Origin,
    pub outcome: Outcome,
    /// Sub-steps that completed before the outcome was decided
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub timestamp: DateTime<Utc>,
}

impl OperationRecord {
    pub fn new(kind: OperationKind, origin: Origin, outcome: Outcome) -> Self {
        Self {
            id: 0,
            kind,
            targets: Vec::new(),
            parameters: IndexMap::new(),
            origin,
            outcome,
            completed_steps: Vec::new(),
            failed_step: None,
            detail: None,
            error_class: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach an error's message and failure class
    pub fn with_error(mut self, error: &Error) -> Self {
        self.detail = Some(error.to_string());
        self.error_class = Some(error.class());
        if let Error::PartialFailure {
            completed, failed, ..
        } = error
        {
            self.completed_steps = completed.clone();
            self.failed_step = Some(failed.clone());
        }
        self
    }
}

// =============================================================================
// Audit Log
// =============================================================================

/// Records kept in memory unless configured otherwise
pub const DEFAULT_RETAINED_RECORDS: usize = 10_000;

struct Retained {
    entries: VecDeque<OperationRecord>,
    next_id: u64,
}

/// Append-only operation log
pub struct AuditLog {
    records: RwLock<Retained>,
    retain: usize,
    event_tx: broadcast::Sender<OperationRecord>,
    sink: Option<Mutex<File>>,
    metrics: Option<ManagerMetrics>,
}

impl AuditLog {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            records: RwLock::new(Retained {
                entries: VecDeque::new(),
                next_id: 1,
            }),
            retain: DEFAULT_RETAINED_RECORDS,
            event_tx,
            sink: None,
            metrics: None,
        }
    }

    /// Keep at most `limit` records in memory; older ones are evicted
    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retain = limit.max(1);
        self
    }

    /// Also append every record as a JSON line to `path`
    pub fn with_sink(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.sink = Some(Mutex::new(file));
        Ok(self)
    }

    pub fn with_metrics(mut self, metrics: ManagerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subscribe to records as they are appended
    pub fn subscribe(&self) -> broadcast::Receiver<OperationRecord> {
        self.event_tx.subscribe()
    }

    /// Append a record, assigning its id and timestamp
    pub fn append(&self, mut record: OperationRecord) -> OperationRecord {
        {
            let mut records = self.records.write();
            record.id = records.next_id;
            records.next_id += 1;
            record.timestamp = Utc::now();
            if records.entries.len() >= self.retain {
                records.entries.pop_front();
            }
            records.entries.push_back(record.clone());

            // Written under the lock so the file keeps id order
            if let Some(sink) = &self.sink {
                self.write_line(sink, &record);
            }
        }

        info!(
            id = record.id,
            kind = %record.kind,
            outcome = %record.outcome,
            origin = %record.origin,
            targets = ?record.targets,
            "Operation recorded"
        );

        if let Some(metrics) = &self.metrics {
            metrics
                .operations_total
                .with_label_values(&[record.kind.as_str(), record.outcome.as_str()])
                .inc();
        }

        // No subscribers is fine
        let _ = self.event_tx.send(record.clone());
        record
    }

    fn write_line(&self, sink: &Mutex<File>, record: &OperationRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Cannot serialize audit record {}: {}", record.id, e);
                return;
            }
        };
        let mut file = sink.lock();
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("Cannot write audit record {}: {}", record.id, e);
        }
    }

    /// Retained records, oldest first
    pub fn records(&self) -> Vec<OperationRecord> {
        self.records.read().entries.iter().cloned().collect()
    }

    /// The `limit` most recent records, oldest first
    pub fn recent(&self, limit: usize) -> Vec<OperationRecord> {
        let records = self.records.read();
        let start = records.entries.len().saturating_sub(limit);
        records.entries.iter().skip(start).cloned().collect()
    }

    pub fn by_kind(&self, kind: OperationKind) -> Vec<OperationRecord> {
        self.records
            .read()
            .entries
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Number of retained records
    pub fn len(&self) -> usize {
        self.records.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().entries.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

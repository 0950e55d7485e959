//! Operation Guard
//!
//! Every mutating operation is admitted through [`OperationGuard::admit`],
//! which runs these stages in order:
//!
//! ```text
//! pre-validate ──► confirm ──► lock (bounded) ──► refresh + re-validate ──► dry-run? ──► permit
//! (caller inv.)   (operator)   LockTimeout         fresh inventory            record
//! ```
//!
//! Confirmation happens before the lock is taken, so it doubles as the
//! cancellation point. The resulting [`OperationPermit`] owns the lock and
//! releases it when dropped; a permit dropped without an outcome records a
//! failure.

use crate::audit::{AuditLog, OperationKind, OperationRecord, Origin, Outcome};
use crate::error::{Error, Result};
use crate::inventory::{InventoryService, ResourceInventory};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the operation guard
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Ask before operator-originated mutations
    pub require_confirmation: bool,
    /// Upper bound for waiting on the lock
    pub operation_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            require_confirmation: true,
            operation_timeout: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Request & Context
// =============================================================================

/// Who is asking and whether anything may actually change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    pub origin: Origin,
    pub dry_run: bool,
}

impl OperationContext {
    pub fn operator(dry_run: bool) -> Self {
        Self {
            origin: Origin::Operator,
            dry_run,
        }
    }

    pub fn monitor(dry_run: bool) -> Self {
        Self {
            origin: Origin::Monitor,
            dry_run,
        }
    }

    pub fn scheduler() -> Self {
        Self {
            origin: Origin::Scheduler,
            dry_run: false,
        }
    }
}

/// The intended action and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    pub targets: Vec<String>,
    pub parameters: IndexMap<String, serde_json::Value>,
}

impl OperationRequest {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            targets: Vec::new(),
            parameters: IndexMap::new(),
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.targets.push(target.into());
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// One-line description for prompts and logs
    pub fn summary(&self) -> String {
        let params = self
            .parameters
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {} {}", self.kind, self.targets.join(","), params)
            .trim_end()
            .to_string()
    }

    fn record(&self, origin: Origin, outcome: Outcome) -> OperationRecord {
        let mut record = OperationRecord::new(self.kind, origin, outcome);
        record.targets = self.targets.clone();
        record.parameters = self.parameters.clone();
        record
    }
}

/// Result of an admitted operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    pub record: OperationRecord,
}

impl OperationReport {
    pub fn outcome(&self) -> Outcome {
        self.record.outcome
    }

    pub fn is_dry_run(&self) -> bool {
        self.record.outcome == Outcome::DryRun
    }
}

// =============================================================================
// Confirmation
// =============================================================================

/// Operator acknowledgement gate
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// `Ok(true)` to proceed, `Ok(false)` to cancel
    async fn confirm(&self, request: &OperationRequest) -> Result<bool>;
}

/// Approves everything (`--yes`)
pub struct AutoApprove;

#[async_trait]
impl Confirmer for AutoApprove {
    async fn confirm(&self, _request: &OperationRequest) -> Result<bool> {
        Ok(true)
    }
}

/// Denies everything
pub struct DenyAll;

#[async_trait]
impl Confirmer for DenyAll {
    async fn confirm(&self, _request: &OperationRequest) -> Result<bool> {
        Ok(false)
    }
}

/// Asks on the terminal, accepting `y` or `yes`
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    async fn confirm(&self, request: &OperationRequest) -> Result<bool> {
        let prompt = format!("About to run: {}\nProceed? [y/N] ", request.summary());

        tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut stderr = std::io::stderr();
            stderr.write_all(prompt.as_bytes())?;
            stderr.flush()?;

            let mut answer = String::new();
            std::io::stdin().lock().read_line(&mut answer)?;
            Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
        })
        .await
        .map_err(|e| Error::Internal(format!("confirmation prompt failed: {}", e)))?
    }
}

// =============================================================================
// Operation Guard
// =============================================================================

/// Outcome of admission
#[derive(Debug)]
pub enum Admission {
    /// Lock held, preconditions hold on a fresh inventory
    Proceed(OperationPermit),
    /// Dry-run recorded, nothing may be executed
    DryRun(OperationReport),
}

/// Single-flight gate for all mutating operations
pub struct OperationGuard {
    config: GuardConfig,
    lock: Arc<Mutex<()>>,
    confirmer: Arc<dyn Confirmer>,
    inventory: InventoryService,
    audit: Arc<AuditLog>,
}

impl OperationGuard {
    pub fn new(
        config: GuardConfig,
        inventory: InventoryService,
        confirmer: Arc<dyn Confirmer>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            lock: Arc::new(Mutex::new(())),
            confirmer,
            inventory,
            audit,
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn inventory_service(&self) -> &InventoryService {
        &self.inventory
    }

    /// Whether a mutation currently holds the lock
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Run the admission stages for `request`
    ///
    /// `validate` is checked against `inventory` (the caller's view) before
    /// anything else, and again against a fresh inventory once the lock is
    /// held. Every rejection is recorded before the error is returned.
    pub async fn admit<V>(
        &self,
        request: OperationRequest,
        context: OperationContext,
        inventory: &ResourceInventory,
        validate: V,
    ) -> Result<Admission>
    where
        V: Fn(&ResourceInventory) -> Result<()>,
    {
        if let Err(e) = validate(inventory) {
            return Err(self.reject(&request, context, e));
        }

        if self.needs_confirmation(context) {
            match self.confirmer.confirm(&request).await {
                Ok(true) => debug!("Confirmed: {}", request.summary()),
                Ok(false) => {
                    let e = Error::Cancelled(format!("{} declined by operator", request.kind));
                    return Err(self.reject(&request, context, e));
                }
                Err(e) => {
                    let e = Error::Cancelled(format!("no confirmation: {}", e));
                    return Err(self.reject(&request, context, e));
                }
            }
        }

        let guard = match tokio::time::timeout(
            self.config.operation_timeout,
            self.lock.clone().lock_owned(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(_) => {
                let e = Error::LockTimeout {
                    timeout: self.config.operation_timeout,
                };
                return Err(self.reject(&request, context, e));
            }
        };

        // Free space may have changed while waiting
        let fresh = match self.inventory.refresh().await {
            Ok(fresh) => fresh,
            Err(e) => return Err(self.reject(&request, context, e)),
        };
        if let Err(e) = validate(&fresh) {
            return Err(self.reject(&request, context, e));
        }

        if context.dry_run {
            info!("Dry run: {}", request.summary());
            let record = self
                .audit
                .append(request.record(context.origin, Outcome::DryRun));
            return Ok(Admission::DryRun(OperationReport { record }));
        }

        Ok(Admission::Proceed(OperationPermit {
            request,
            context,
            inventory: fresh,
            audit: self.audit.clone(),
            completed: Vec::new(),
            finished: false,
            _lock: guard,
        }))
    }

    /// Record a failure for a request that never got a permit
    pub fn reject(&self, request: &OperationRequest, context: OperationContext, error: Error) -> Error {
        let outcome = match error {
            Error::Cancelled(_) => Outcome::Cancelled,
            _ => Outcome::Failure,
        };
        warn!("{} rejected: {}", request.kind, error);
        self.audit
            .append(request.record(context.origin, outcome).with_error(&error));
        error
    }

    fn needs_confirmation(&self, context: OperationContext) -> bool {
        self.config.require_confirmation && context.origin == Origin::Operator && !context.dry_run
    }
}

// =============================================================================
// Operation Permit
// =============================================================================

/// Proof of admission; holds the operation lock until dropped
pub struct OperationPermit {
    request: OperationRequest,
    context: OperationContext,
    inventory: ResourceInventory,
    audit: Arc<AuditLog>,
    completed: Vec<String>,
    finished: bool,
    _lock: OwnedMutexGuard<()>,
}

impl OperationPermit {
    pub fn request(&self) -> &OperationRequest {
        &self.request
    }

    pub fn context(&self) -> OperationContext {
        self.context
    }

    /// Inventory refreshed after the lock was taken
    pub fn inventory(&self) -> &ResourceInventory {
        &self.inventory
    }

    /// Note a sub-step that completed
    pub fn step_done(&mut self, step: impl Into<String>) {
        self.completed.push(step.into());
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }

    pub fn succeed(mut self) -> OperationReport {
        let record = self.finish(Outcome::Success, None, None);
        OperationReport { record }
    }

    /// Primary mutation done, `failed_step` did not complete
    pub fn partial(mut self, failed_step: &str, error: &Error) -> OperationReport {
        warn!(
            "{} partially succeeded, {} failed: {}",
            self.request.kind, failed_step, error
        );
        let record = self.finish(
            Outcome::PartialSuccess,
            Some(failed_step.to_string()),
            Some(error),
        );
        OperationReport { record }
    }

    /// Record a failure and hand the error back
    pub fn fail(mut self, error: Error) -> Error {
        self.finish(Outcome::Failure, None, Some(&error));
        error
    }

    fn finish(
        &mut self,
        outcome: Outcome,
        failed_step: Option<String>,
        error: Option<&Error>,
    ) -> OperationRecord {
        self.finished = true;
        let mut record = self.request.record(self.context.origin, outcome);
        if let Some(error) = error {
            record = record.with_error(error);
        }
        if record.completed_steps.is_empty() {
            record.completed_steps = self.completed.clone();
        }
        if failed_step.is_some() {
            record.failed_step = failed_step;
        }
        self.audit.append(record)
    }
}

impl std::fmt::Debug for OperationPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationPermit")
            .field("request", &self.request)
            .field("context", &self.context)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        if !self.finished {
            warn!("{} ended without an outcome", self.request.kind);
            let error = Error::Internal("operation abandoned before completion".into());
            self.finish(Outcome::Failure, None, Some(&error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;
    use crate::domain::ports::VolumeBackend;
    use crate::domain::units::{GIB, MIB};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize, bool);

    #[async_trait]
    impl Confirmer for Counting {
        async fn confirm(&self, _request: &OperationRequest) -> Result<bool> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(self.1)
        }
    }

    fn setup(
        require_confirmation: bool,
        confirmer: Arc<dyn Confirmer>,
        timeout: Duration,
    ) -> (Arc<InMemoryBackend>, Arc<OperationGuard>) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.seed_volume_group("data_vg", 4 * MIB, &[("/dev/sdb", 100 * GIB)]);
        let guard = OperationGuard::new(
            GuardConfig {
                require_confirmation,
                operation_timeout: timeout,
            },
            InventoryService::new(backend.clone()),
            confirmer,
            Arc::new(AuditLog::new()),
        );
        (backend, Arc::new(guard))
    }

    fn request() -> OperationRequest {
        OperationRequest::new(OperationKind::CreateLv)
            .target("data_vg/app")
            .param("size_bytes", GIB)
    }

    fn ok(_: &ResourceInventory) -> Result<()> {
        Ok(())
    }

    #[tokio::test]
    async fn test_denied_confirmation_cancels_without_lock() {
        let confirmer = Arc::new(Counting(AtomicUsize::new(0), false));
        let (_, guard) = setup(true, confirmer.clone(), Duration::from_secs(1));
        let inventory = ResourceInventory::empty();

        let result = guard
            .admit(request(), OperationContext::operator(false), &inventory, ok)
            .await;
        assert_matches!(result, Err(Error::Cancelled(_)));
        assert_eq!(confirmer.0.load(Ordering::SeqCst), 1);
        assert!(!guard.is_busy());
        assert_eq!(guard.audit().recent(1)[0].outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_monitor_and_dry_run_skip_confirmation() {
        let confirmer = Arc::new(Counting(AtomicUsize::new(0), false));
        let (backend, guard) = setup(true, confirmer.clone(), Duration::from_secs(1));
        let inventory = ResourceInventory::empty();

        let admission = guard
            .admit(request(), OperationContext::monitor(false), &inventory, ok)
            .await
            .unwrap();
        assert_matches!(admission, Admission::Proceed(permit) => { permit.succeed(); });

        let admission = guard
            .admit(request(), OperationContext::operator(true), &inventory, ok)
            .await
            .unwrap();
        assert_matches!(admission, Admission::DryRun(report) => {
            assert!(report.is_dry_run());
            assert_eq!(report.record.parameters["size_bytes"], GIB);
        });

        assert_eq!(confirmer.0.load(Ordering::SeqCst), 0);
        assert_eq!(backend.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_prevalidation_failure_skips_confirmation() {
        let confirmer = Arc::new(Counting(AtomicUsize::new(0), true));
        let (_, guard) = setup(true, confirmer.clone(), Duration::from_secs(1));
        let inventory = ResourceInventory::empty();

        let result = guard
            .admit(request(), OperationContext::operator(false), &inventory, |inv| {
                inv.allocatable("data_vg", 5).map(|_| ())
            })
            .await;
        assert_matches!(result, Err(Error::VolumeGroupNotFound { .. }));
        assert_eq!(confirmer.0.load(Ordering::SeqCst), 0);

        let record = &guard.audit().recent(1)[0];
        assert_eq!(record.outcome, Outcome::Failure);
        assert_eq!(record.error_class, Some(crate::error::ErrorClass::Validation));
    }

    #[tokio::test]
    async fn test_revalidates_against_fresh_inventory() {
        let (backend, guard) = setup(false, Arc::new(AutoApprove), Duration::from_secs(1));
        let stale = ResourceInventory::empty();

        // The VG only exists in the backend, not in the caller's inventory
        let admission = guard
            .admit(request(), OperationContext::operator(false), &stale, |inv| {
                if inv.vgs.is_empty() || inv.vg("data_vg").is_some() {
                    Ok(())
                } else {
                    Err(Error::VolumeGroupNotFound { name: "data_vg".into() })
                }
            })
            .await
            .unwrap();
        let permit = assert_matches!(admission, Admission::Proceed(p) => p);
        assert!(permit.inventory().vg("data_vg").is_some());
        drop(permit);

        backend.set_available(false);
        let result = guard
            .admit(request(), OperationContext::operator(false), &stale, ok)
            .await;
        assert_matches!(result, Err(Error::BackendUnavailable { .. }));
        assert!(!guard.is_busy());
    }

    #[tokio::test]
    async fn test_dropped_permit_records_failure_and_releases_lock() {
        let (_, guard) = setup(false, Arc::new(AutoApprove), Duration::from_secs(1));
        let inventory = ResourceInventory::empty();

        let admission = guard
            .admit(request(), OperationContext::operator(false), &inventory, ok)
            .await
            .unwrap();
        assert!(guard.is_busy());
        drop(admission);

        assert!(!guard.is_busy());
        let record = &guard.audit().recent(1)[0];
        assert_eq!(record.outcome, Outcome::Failure);
        assert!(record.detail.as_deref().unwrap_or_default().contains("abandoned"));
    }

    #[tokio::test]
    async fn test_lock_timeout_while_held() {
        let (_, guard) = setup(false, Arc::new(AutoApprove), Duration::from_millis(50));
        let inventory = ResourceInventory::empty();

        let first = guard
            .admit(request(), OperationContext::operator(false), &inventory, ok)
            .await
            .unwrap();
        let second = guard
            .admit(request(), OperationContext::monitor(false), &inventory, ok)
            .await;
        assert_matches!(second, Err(Error::LockTimeout { .. }));
        drop(first);
    }

    #[tokio::test]
    async fn test_concurrent_operations_never_overlap_at_backend() {
        let (backend, guard) = setup(false, Arc::new(AutoApprove), Duration::from_secs(5));
        backend.add_device("/dev/sdc", 10 * GIB);
        backend.add_device("/dev/sdd", 10 * GIB);
        backend.set_latency(Duration::from_millis(30));

        let mut handles = Vec::new();
        for device in ["/dev/sdc", "/dev/sdd"] {
            let guard = guard.clone();
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                let inventory = ResourceInventory::empty();
                let request = OperationRequest::new(OperationKind::CreatePv).target(device);
                let admission = guard
                    .admit(request, OperationContext::operator(false), &inventory, ok)
                    .await
                    .unwrap();
                if let Admission::Proceed(mut permit) = admission {
                    backend.create_physical_volume(device).await.unwrap();
                    permit.step_done(device);
                    permit.succeed();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(backend.mutation_count(), 2);
        assert_eq!(backend.max_concurrent_mutations(), 1);
        assert_eq!(guard.audit().by_kind(OperationKind::CreatePv).len(), 2);
    }
}

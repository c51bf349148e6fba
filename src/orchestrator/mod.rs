//! Inspection service: accepts jobs, drives them through federation,
//! inspection and commit, and answers the control API.
//!
//! Overall progress is split into fixed phases: federation 0-5, inspectors
//! 5-90 (one equal band per inspector, run sequentially), commit at 95, and
//! 100 on the terminal transition.

pub mod job;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::cloud::CloudConnector;
use crate::config::Config;
use crate::error::{AuditError, FederationError, Result};
use crate::federation::{CredentialFederator, FederationContext, TrustBroker};
use crate::inspect::registry::InspectorInfo;
use crate::inspect::runner::{self, InspectorRun, ItemRunState, RunContext, SkipReason};
use crate::inspect::scoring::{self, ItemVerdict};
use crate::inspect::{Finding, Inspector, InspectorRegistry, ServiceType};
use crate::progress::protocol::InspectionDirectory;
use crate::progress::{ProgressBand, ProgressBroadcaster, ProgressEvent};
use crate::store::{HistoryQuery, InspectionItemResult, KvTable, ResultStore};

pub use job::{
    FailurePhase, Inspection, InspectionId, InspectionStatus, ItemFailure, ServiceScope,
    StatusView,
};

const FEDERATED_PERCENT: u8 = 5;
const INSPECTORS_BAND: ProgressBand = ProgressBand::new(FEDERATED_PERCENT, 90);
const COMMIT_PERCENT: u8 = 95;

/// Body of a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// A service type name or `all`.
    pub service_type: String,
    pub role_identifier: String,
    /// Empty means every supported item of the selected services.
    #[serde(default)]
    pub selected_items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSettings {
    pub checker_timeout: Duration,
    pub max_concurrent_checkers: usize,
    pub external_id: Option<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ExecutionSettings {
    fn from(config: &Config) -> Self {
        Self {
            checker_timeout: config.execution.checker_timeout(),
            max_concurrent_checkers: config.execution.max_concurrent_checkers,
            external_id: config.federation.external_id.clone(),
        }
    }
}

struct PlannedInspector {
    inspector: Arc<dyn Inspector>,
    items: Vec<String>,
}

#[derive(Clone)]
struct JobEntry {
    record: Arc<Mutex<Inspection>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// What stays in memory once a job's record is durable.
#[derive(Debug, Clone)]
struct FinishedJob {
    customer_id: String,
    status: InspectionStatus,
}

fn with_record<T>(job: &JobEntry, f: impl FnOnce(&mut Inspection) -> T) -> T {
    let mut record = job.record.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut record)
}

struct PendingResult {
    result: InspectionItemResult,
    commit: bool,
}

/// Everything a job run produced, folded into the record on finish.
#[derive(Default)]
struct JobOutcome {
    results: Vec<PendingResult>,
    failures: Vec<ItemFailure>,
    resource_counts: BTreeMap<String, usize>,
    checked: usize,
}

impl JobOutcome {
    /// Outcome for a job that never reached its inspectors.
    fn not_started(plan: &[PlannedInspector], phase: FailurePhase, message: &str) -> Self {
        let mut outcome = Self::default();
        for planned in plan {
            for item in &planned.items {
                outcome.failures.push(ItemFailure {
                    service_type: Some(planned.inspector.service_type()),
                    item_id: Some(item.clone()),
                    phase,
                    message: message.to_string(),
                });
            }
        }
        outcome
    }

    fn absorb(&mut self, customer_id: &str, inspection_id: InspectionId, run: InspectorRun) {
        let service = run.service_type;
        self.resource_counts.extend(run.resource_counts);

        for item in run.items {
            let (verdict, commit) = match &item.state {
                ItemRunState::Checked => {
                    self.checked += 1;
                    (scoring::evaluate(&item.findings), true)
                }
                ItemRunState::CheckerFailed(message) => {
                    self.failures.push(ItemFailure {
                        service_type: Some(service),
                        item_id: Some(item.item_id.clone()),
                        phase: FailurePhase::Check,
                        message: message.clone(),
                    });
                    (scoring::not_checked(&item.findings), true)
                }
                ItemRunState::Skipped(reason) => {
                    self.failures.push(ItemFailure {
                        service_type: Some(service),
                        item_id: Some(item.item_id.clone()),
                        phase: skip_phase(reason),
                        message: reason.to_string(),
                    });
                    (scoring::not_checked(&item.findings), false)
                }
            };
            self.results.push(PendingResult {
                result: item_result(customer_id, inspection_id, service, item.item_id, item.findings, verdict),
                commit,
            });
        }
    }
}

fn skip_phase(reason: &SkipReason) -> FailurePhase {
    match reason {
        SkipReason::CollectionFailed(_) => FailurePhase::Collection,
        SkipReason::Cancelled => FailurePhase::Cancelled,
        SkipReason::CredentialExpired => FailurePhase::Expired,
    }
}

fn item_result(
    customer_id: &str,
    inspection_id: InspectionId,
    service: ServiceType,
    item_id: String,
    findings: Vec<Finding>,
    verdict: ItemVerdict,
) -> InspectionItemResult {
    InspectionItemResult {
        customer_id: customer_id.to_string(),
        service_type: service,
        item_id,
        status: verdict.status,
        total_resources: verdict.total_resources,
        issues_found: verdict.issues_found,
        risk_level: verdict.risk_level,
        score: verdict.score,
        findings,
        recommendations: verdict.recommendations,
        last_inspection_id: inspection_id,
        last_inspection_time: Utc::now(),
    }
}

/// Owns every inspection job of this process.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InspectionService {
    inner: Arc<Inner>,
}

struct Inner {
    registry: InspectorRegistry,
    federator: CredentialFederator,
    connector: Arc<dyn CloudConnector>,
    store: ResultStore,
    broadcaster: Arc<ProgressBroadcaster>,
    settings: ExecutionSettings,
    /// Jobs still running, or whose final record could not be stored.
    jobs: RwLock<HashMap<InspectionId, JobEntry>>,
    finished: RwLock<HashMap<InspectionId, FinishedJob>>,
}

impl std::fmt::Debug for InspectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InspectionService")
            .field("registry", &self.inner.registry)
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl InspectionService {
    pub fn new(
        registry: InspectorRegistry,
        federator: CredentialFederator,
        connector: Arc<dyn CloudConnector>,
        store: ResultStore,
        broadcaster: Arc<ProgressBroadcaster>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                federator,
                connector,
                store,
                broadcaster,
                settings,
                jobs: RwLock::new(HashMap::new()),
                finished: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Service with the built-in inspectors, wired from `config`.
    pub fn from_config(
        config: &Config,
        broker: Arc<dyn TrustBroker>,
        connector: Arc<dyn CloudConnector>,
        table: Arc<dyn KvTable>,
    ) -> Self {
        let federator = CredentialFederator::new(
            broker,
            config.federation.retry_policy(),
            config.federation.session_duration(),
        );
        Self::new(
            InspectorRegistry::builtin(),
            federator,
            connector,
            ResultStore::new(table),
            Arc::new(ProgressBroadcaster::new(config.progress.subscriber_buffer)),
            ExecutionSettings::from(config),
        )
    }

    pub fn broadcaster(&self) -> Arc<ProgressBroadcaster> {
        Arc::clone(&self.inner.broadcaster)
    }

    pub fn store(&self) -> &ResultStore {
        &self.inner.store
    }

    /// Accept a job and run it in the background.
    ///
    /// Returns as soon as the PENDING record is stored and its progress topic
    /// exists. Unknown service types and item ids are rejected here, before
    /// any job is created.
    pub async fn start(&self, customer_id: &str, request: StartRequest) -> Result<InspectionId> {
        let customer_id = customer_id.trim();
        if customer_id.is_empty() {
            return Err(AuditError::InvalidRequest("customerId is required".into()));
        }
        let scope: ServiceScope = request.service_type.parse()?;
        let plan = self.plan(scope, &request.selected_items)?;

        let selected: BTreeSet<String> = plan
            .iter()
            .flat_map(|planned| planned.items.iter().cloned())
            .collect();
        let inspection = Inspection::new(
            customer_id,
            scope,
            request.role_identifier.trim(),
            selected,
        );
        let id = inspection.inspection_id;
        self.inner.store.save_inspection(&inspection).await?;

        tracing::info!(
            inspection_id = %id,
            customer = customer_id,
            scope = %scope,
            items = inspection.selected_items.len(),
            "inspection accepted"
        );

        self.inner.broadcaster.open_topic(id);
        let (done_tx, done_rx) = watch::channel(false);
        let job = JobEntry {
            record: Arc::new(Mutex::new(inspection)),
            cancel: CancellationToken::new(),
            done: done_rx,
        };
        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, job.clone());

        let service = self.clone();
        let role_identifier = request.role_identifier;
        let plan = Arc::new(plan);
        tokio::spawn(async move {
            // Nested so a panic anywhere in the run still ends the job.
            let run = tokio::spawn({
                let service = service.clone();
                let job = job.clone();
                let plan = Arc::clone(&plan);
                async move { service.execute(&job, &plan, &role_identifier).await }
            });
            let persisted = match run.await {
                Ok(persisted) => persisted,
                Err(e) => service.abort(&job, &plan, &e).await,
            };
            if persisted {
                service.retire(id, &job);
            }
            // Nobody may be waiting.
            let _ = done_tx.send(true);
        });

        Ok(id)
    }

    /// Full job record, from memory while this process knows the job,
    /// otherwise from the store.
    pub async fn get_inspection(&self, customer_id: &str, id: InspectionId) -> Result<Inspection> {
        if let Some(job) = self.job(id) {
            return with_record(&job, |r| {
                (r.customer_id == customer_id).then(|| r.clone())
            })
            .ok_or_else(|| AuditError::InspectionNotFound(id.to_string()));
        }
        self.inner
            .store
            .load_inspection(customer_id, id)
            .await?
            .ok_or_else(|| AuditError::InspectionNotFound(id.to_string()))
    }

    /// `{status, progressPercent, currentStep}` for polling clients.
    pub async fn inspection_status(&self, customer_id: &str, id: InspectionId) -> Result<StatusView> {
        if let Some(job) = self.job(id) {
            return with_record(&job, |r| {
                (r.customer_id == customer_id).then(|| r.status_view())
            })
            .ok_or_else(|| AuditError::InspectionNotFound(id.to_string()));
        }
        Ok(self.get_inspection(customer_id, id).await?.status_view())
    }

    /// Request cancellation. Checkers already running finish or time out;
    /// nothing further is dispatched. Returns false if the job had finished.
    pub fn cancel(&self, customer_id: &str, id: InspectionId) -> Result<bool> {
        let Some(job) = self.job(id) else {
            return match self.finished(id) {
                Some(finished) if finished.customer_id == customer_id => Ok(false),
                _ => Err(AuditError::InspectionNotFound(id.to_string())),
            };
        };
        if !with_record(&job, |r| r.customer_id == customer_id) {
            return Err(AuditError::InspectionNotFound(id.to_string()));
        }
        if with_record(&job, |r| r.status.is_terminal()) {
            return Ok(false);
        }
        tracing::info!(inspection_id = %id, "cancellation requested");
        job.cancel.cancel();
        Ok(true)
    }

    /// Wait until a job of this process reaches a terminal state.
    pub async fn wait(&self, id: InspectionId) -> Result<Inspection> {
        if let Some(job) = self.job(id) {
            let mut done = job.done.clone();
            // Only a dead supervisor task closes the channel; report the
            // record as it stands.
            let _ = done.wait_for(|finished| *finished).await;
            return Ok(with_record(&job, |r| r.clone()));
        }
        let finished = self
            .finished(id)
            .ok_or_else(|| AuditError::InspectionNotFound(id.to_string()))?;
        self.inner
            .store
            .load_inspection(&finished.customer_id, id)
            .await?
            .ok_or_else(|| AuditError::InspectionNotFound(id.to_string()))
    }

    /// HISTORY records, newest first.
    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<InspectionItemResult>> {
        Ok(self.inner.store.history(query).await?)
    }

    /// LATEST record of every item, grouped by service type then item id.
    pub async fn items_status(
        &self,
        customer_id: &str,
    ) -> Result<BTreeMap<ServiceType, BTreeMap<String, InspectionItemResult>>> {
        Ok(self.inner.store.items_status(customer_id).await?)
    }

    pub async fn list_inspections(&self, customer_id: &str) -> Result<Vec<Inspection>> {
        Ok(self.inner.store.list_inspections(customer_id).await?)
    }

    pub fn list_inspectors(&self) -> Vec<InspectorInfo> {
        self.inner.registry.catalog()
    }

    fn job(&self, id: InspectionId) -> Option<JobEntry> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn finished(&self, id: InspectionId) -> Option<FinishedJob> {
        self.inner
            .finished
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Drop the full record of a durably stored job, keeping its owner and
    /// status for lookups.
    fn retire(&self, id: InspectionId, job: &JobEntry) {
        let (customer_id, status) = with_record(job, |r| (r.customer_id.clone(), r.status));
        self.inner
            .finished
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, FinishedJob { customer_id, status });
        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        tracing::debug!(inspection_id = %id, "retired inspection from memory");
    }

    /// Fail a job whose task died before reaching a terminal state.
    async fn abort(&self, job: &JobEntry, plan: &[PlannedInspector], error: &JoinError) -> bool {
        let (id, terminal) = with_record(job, |r| (r.inspection_id, r.status.is_terminal()));
        tracing::error!(inspection_id = %id, error = %error, "inspection task aborted");
        if terminal {
            self.inner.broadcaster.close_topic(id);
            return false;
        }
        let outcome = JobOutcome::not_started(
            plan,
            FailurePhase::Aborted,
            &format!("inspection task aborted: {error}"),
        );
        self.finish(job, InspectionStatus::Failed, outcome, None).await
    }

    /// Resolve the inspectors and items a request covers, in registry and
    /// checker order.
    fn plan(&self, scope: ServiceScope, selected: &[String]) -> Result<Vec<PlannedInspector>> {
        let inspectors = match scope {
            ServiceScope::All => self
                .inner
                .registry
                .service_types()
                .into_iter()
                .map(|service| self.inner.registry.get(service))
                .collect::<Result<Vec<_>>>()?,
            ServiceScope::Only(service) => vec![self.inner.registry.get(service)?],
        };

        let wanted: BTreeSet<&str> = selected
            .iter()
            .map(|item| item.trim())
            .filter(|item| !item.is_empty())
            .collect();
        if let Some(unknown) = wanted
            .iter()
            .find(|item| inspectors.iter().all(|i| i.checker(item).is_none()))
        {
            return Err(AuditError::UnknownItem {
                service: scope.to_string(),
                item: unknown.to_string(),
            });
        }

        let plan: Vec<PlannedInspector> = inspectors
            .into_iter()
            .filter_map(|inspector| {
                let items: Vec<String> = inspector
                    .supported_items()
                    .iter()
                    .map(|definition| definition.id)
                    .filter(|id| wanted.is_empty() || wanted.contains(id))
                    .map(str::to_string)
                    .collect();
                (!items.is_empty()).then_some(PlannedInspector { inspector, items })
            })
            .collect();

        if plan.is_empty() {
            return Err(AuditError::InvalidRequest(format!(
                "no inspectable items for service type '{scope}'"
            )));
        }
        Ok(plan)
    }

    /// Run a job to its terminal state. Returns whether the final record
    /// was stored.
    async fn execute(&self, job: &JobEntry, plan: &[PlannedInspector], role_identifier: &str) -> bool {
        let (id, customer_id) = with_record(job, |r| (r.inspection_id, r.customer_id.clone()));
        self.progress(job, 1, "federating into customer account");

        let context = FederationContext {
            session_name: format!("cloudaudit-{id}"),
            external_id: self.inner.settings.external_id.clone(),
        };
        let federated = tokio::select! {
            result = self.inner.federator.federate(role_identifier, &context) => Some(result),
            () = job.cancel.cancelled() => None,
        };
        let credential = match federated {
            Some(Ok(credential)) if !job.cancel.is_cancelled() => credential,
            Some(Err(e)) => {
                let outcome = JobOutcome::not_started(plan, FailurePhase::Federation, &e.to_string());
                return self.finish(job, InspectionStatus::Failed, outcome, Some(e)).await;
            }
            Some(Ok(_)) | None => {
                let outcome = JobOutcome::not_started(
                    plan,
                    FailurePhase::Cancelled,
                    &SkipReason::Cancelled.to_string(),
                );
                return self.finish(job, InspectionStatus::Failed, outcome, None).await;
            }
        };

        let session = match self.inner.connector.connect(&credential) {
            Ok(session) => session,
            Err(e) => {
                let error = FederationError::denied(format!("could not open cloud session: {e}"));
                let outcome =
                    JobOutcome::not_started(plan, FailurePhase::Federation, &error.to_string());
                return self.finish(job, InspectionStatus::Failed, outcome, Some(error)).await;
            }
        };

        self.transition(job, InspectionStatus::InProgress).await;
        self.progress(job, FEDERATED_PERCENT, "federated");

        let ctx = RunContext {
            cancel: job.cancel.clone(),
            credential_expiry: credential.expiry,
            call_timeout: self.inner.settings.checker_timeout,
            max_concurrency: self.inner.settings.max_concurrent_checkers,
        };
        let mut outcome = JobOutcome::default();

        for (index, planned) in plan.iter().enumerate() {
            let band = INSPECTORS_BAND.split(index, plan.len());
            let (tx, mut rx) = mpsc::unbounded_channel();
            let run = runner::run_inspector(
                Arc::clone(&planned.inspector),
                Arc::clone(&session),
                &planned.items,
                &ctx,
                tx,
            );
            let forward = async {
                while let Some(update) = rx.recv().await {
                    self.progress(job, band.map(update.percent), update.step);
                }
            };
            let (run, ()) = tokio::join!(run, forward);
            outcome.absorb(&customer_id, id, run);
        }

        // Session credentials end with the job.
        drop(session);
        drop(credential);

        self.progress(job, COMMIT_PERCENT, "committing results");
        let mut committed = 0;
        if outcome.checked > 0 {
            for pending in outcome.results.iter().filter(|p| p.commit) {
                let result = &pending.result;
                match self
                    .inner
                    .store
                    .commit_item_result(&customer_id, id, result)
                    .await
                {
                    Ok(()) => committed += 1,
                    Err(e) => {
                        tracing::error!(
                            inspection_id = %id,
                            service = %result.service_type,
                            item = %result.item_id,
                            error = %e,
                            "item commit failed"
                        );
                        outcome.failures.push(ItemFailure {
                            service_type: Some(result.service_type),
                            item_id: Some(result.item_id.clone()),
                            phase: FailurePhase::Commit,
                            message: e.to_string(),
                        });
                    }
                }
            }
        } else {
            tracing::warn!(inspection_id = %id, "no item could be evaluated, nothing committed");
        }

        let status = if outcome.checked == 0 || committed == 0 {
            InspectionStatus::Failed
        } else if outcome.failures.is_empty() {
            InspectionStatus::Completed
        } else {
            InspectionStatus::Partial
        };
        self.finish(job, status, outcome, None).await
    }

    /// Record progress and publish it when the percent strictly increased.
    fn progress(&self, job: &JobEntry, percent: u8, step: impl Into<String>) {
        let event = with_record(job, |r| {
            r.advance(percent, step).then(|| {
                ProgressEvent::new(r.inspection_id, r.progress_percent, r.current_step.clone(), r.status)
            })
        });
        if let Some(event) = event {
            self.inner.broadcaster.publish(event);
        }
    }

    async fn transition(&self, job: &JobEntry, next: InspectionStatus) {
        let snapshot = with_record(job, |r| {
            if let Err(e) = r.transition(next) {
                tracing::error!(error = %e, "rejected inspection transition");
            }
            r.clone()
        });
        self.persist(&snapshot).await;
    }

    async fn finish(
        &self,
        job: &JobEntry,
        status: InspectionStatus,
        outcome: JobOutcome,
        federation_error: Option<FederationError>,
    ) -> bool {
        let snapshot = with_record(job, |r| {
            r.advance(100, format!("inspection {}", status.to_string().to_lowercase()));
            r.results = outcome.results.into_iter().map(|p| p.result).collect();
            r.failures = outcome.failures;
            r.resource_counts = outcome.resource_counts;
            r.federation_error = federation_error;
            if let Err(e) = r.transition(status) {
                tracing::error!(error = %e, "rejected terminal transition");
            }
            r.clone()
        });
        let persisted = self.persist(&snapshot).await;

        tracing::info!(
            inspection_id = %snapshot.inspection_id,
            status = %snapshot.status,
            items = snapshot.results.len(),
            failures = snapshot.failures.len(),
            "inspection finished"
        );

        self.inner.broadcaster.publish(ProgressEvent::new(
            snapshot.inspection_id,
            snapshot.progress_percent,
            snapshot.current_step.clone(),
            snapshot.status,
        ));
        self.inner.broadcaster.close_topic(snapshot.inspection_id);
        persisted
    }

    async fn persist(&self, inspection: &Inspection) -> bool {
        match self.inner.store.save_inspection(inspection).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    inspection_id = %inspection.inspection_id,
                    error = %e,
                    "failed to persist inspection record"
                );
                false
            }
        }
    }
}

impl InspectionDirectory for InspectionService {
    fn owner_and_status(&self, inspection_id: InspectionId) -> Option<(String, InspectionStatus)> {
        match self.job(inspection_id) {
            Some(job) => Some(with_record(&job, |r| (r.customer_id.clone(), r.status))),
            None => self
                .finished(inspection_id)
                .map(|finished| (finished.customer_id, finished.status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::snapshot::{InventorySnapshot, SnapshotConnector};
    use crate::cloud::Bucket;
    use crate::federation::StaticTrustBroker;
    use crate::inspect::ItemStatus;
    use crate::store::memory::InMemoryTable;

    const ROLE: &str = "arn:aws:iam::123456789012:role/Audit";

    fn service(snapshot: InventorySnapshot) -> InspectionService {
        InspectionService::from_config(
            &Config::default(),
            Arc::new(StaticTrustBroker::new(chrono::Duration::minutes(30))),
            Arc::new(SnapshotConnector::new(snapshot)),
            Arc::new(InMemoryTable::new()),
        )
    }

    fn request(service_type: &str, items: &[&str]) -> StartRequest {
        StartRequest {
            service_type: service_type.into(),
            role_identifier: ROLE.into(),
            selected_items: items.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn snapshot() -> InventorySnapshot {
        InventorySnapshot {
            buckets: vec![Bucket {
                name: "logs".into(),
                region: "us-east-1".into(),
                public_access_blocked: true,
                encryption: None,
                versioning_enabled: true,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_service_and_item_are_rejected_before_start() {
        let service = service(snapshot());
        assert!(matches!(
            service.start("acme", request("dns", &[])).await,
            Err(AuditError::UnsupportedServiceType(_))
        ));
        assert!(matches!(
            service.start("acme", request("storage", &["mfa"])).await,
            Err(AuditError::UnknownItem { .. })
        ));
        assert!(matches!(
            service.start(" ", request("storage", &[])).await,
            Err(AuditError::InvalidRequest(_))
        ));
        assert!(service.list_inspections("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_selection_runs_every_supported_item() {
        let service = service(snapshot());
        let id = service.start("acme", request("storage", &[])).await.unwrap();
        let done = service.wait(id).await.unwrap();
        assert_eq!(done.status, InspectionStatus::Completed);
        assert_eq!(
            done.selected_items,
            BTreeSet::from([
                "encryption".to_string(),
                "public_access".to_string(),
                "versioning".to_string()
            ])
        );
        assert_eq!(done.progress_percent, 100);
        let encryption = done
            .results
            .iter()
            .find(|r| r.item_id == "encryption")
            .unwrap();
        assert_eq!(encryption.status, ItemStatus::Fail);
        assert_eq!(encryption.issues_found, 1);
    }

    #[tokio::test]
    async fn all_scope_covers_every_service() {
        let service = service(snapshot());
        let id = service.start("acme", request("all", &[])).await.unwrap();
        let done = service.wait(id).await.unwrap();
        assert_eq!(done.status, InspectionStatus::Completed);
        let services: BTreeSet<_> = done.results.iter().map(|r| r.service_type).collect();
        assert_eq!(services.len(), ServiceType::ALL.len());

        let status = service.items_status("acme").await.unwrap();
        assert_eq!(status.len(), ServiceType::ALL.len());
    }

    #[tokio::test]
    async fn malformed_role_fails_job_without_results() {
        let service = service(snapshot());
        let mut bad = request("storage", &["encryption"]);
        bad.role_identifier = "not-an-arn".into();
        let id = service.start("acme", bad).await.unwrap();
        let done = service.wait(id).await.unwrap();

        assert_eq!(done.status, InspectionStatus::Failed);
        assert_eq!(
            done.federation_error.map(|e| e.kind),
            Some(crate::error::FederationErrorKind::Malformed)
        );
        assert_eq!(done.failures[0].phase, FailurePhase::Federation);
        assert!(service.items_status("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_job_is_readable_from_store() {
        let service = service(snapshot());
        let id = service.start("acme", request("storage", &[])).await.unwrap();
        service.wait(id).await.unwrap();

        let stored = service.store().load_inspection("acme", id).await.unwrap().unwrap();
        assert_eq!(stored.status, InspectionStatus::Completed);
        assert_eq!(stored.results.len(), 3);

        assert!(matches!(
            service.get_inspection("globex", id).await,
            Err(AuditError::InspectionNotFound(_))
        ));
        assert!(!service.cancel("acme", id).unwrap());
    }

    #[tokio::test]
    async fn directory_reports_owner_and_status() {
        let service = service(snapshot());
        let id = service.start("acme", request("storage", &[])).await.unwrap();
        service.wait(id).await.unwrap();
        assert_eq!(
            service.owner_and_status(id),
            Some(("acme".to_string(), InspectionStatus::Completed))
        );
        assert!(!service.broadcaster().has_topic(id));
    }

    struct BrokenConnector;

    impl CloudConnector for BrokenConnector {
        fn connect(
            &self,
            _: &crate::federation::Credential,
        ) -> std::result::Result<Arc<dyn crate::cloud::CloudSession>, crate::error::CloudError>
        {
            panic!("connector bug");
        }
    }

    #[tokio::test]
    async fn panicking_job_task_still_reaches_failed() {
        let service = InspectionService::from_config(
            &Config::default(),
            Arc::new(StaticTrustBroker::new(chrono::Duration::minutes(30))),
            Arc::new(BrokenConnector),
            Arc::new(InMemoryTable::new()),
        );
        let id = service.start("acme", request("storage", &[])).await.unwrap();

        let done = tokio::time::timeout(std::time::Duration::from_secs(5), service.wait(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, InspectionStatus::Failed);
        assert_eq!(done.progress_percent, 100);
        assert_eq!(done.failures.len(), 3);
        assert!(done
            .failures
            .iter()
            .all(|f| f.phase == FailurePhase::Aborted));
        assert!(!service.broadcaster().has_topic(id));

        let stored = service.get_inspection("acme", id).await.unwrap();
        assert_eq!(stored.status, InspectionStatus::Failed);
    }

    #[tokio::test]
    async fn finished_jobs_leave_memory_but_stay_readable() {
        let service = service(snapshot());
        let id = service.start("acme", request("storage", &[])).await.unwrap();
        let done = service.wait(id).await.unwrap();

        assert!(service.inner.jobs.read().unwrap().is_empty());
        assert_eq!(service.wait(id).await.unwrap(), done);
        assert_eq!(service.get_inspection("acme", id).await.unwrap(), done);
        assert_eq!(
            service.inspection_status("acme", id).await.unwrap(),
            done.status_view()
        );
        assert!(matches!(
            service.cancel("globex", id),
            Err(AuditError::InspectionNotFound(_))
        ));
        assert!(!service.cancel("acme", id).unwrap());
    }

    #[test]
    fn catalog_lists_builtin_inspectors() {
        let service = service(InventorySnapshot::default());
        let catalog = service.list_inspectors();
        assert_eq!(catalog.len(), 3);
        assert!(catalog.iter().all(|info| !info.items.is_empty()));
    }
}

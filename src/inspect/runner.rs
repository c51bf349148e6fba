//! Drives a single inspector through one run.
//!
//! Phases and their local percent band: inventory collection 0-20, checks
//! 20-90, finalize 90-100. The orchestrator maps this local band into its own
//! overall percentage.
//!
//! Every checker runs in its own task. A returned error, a timeout, a panic,
//! or an invalid finding is converted into a synthetic failure finding for
//! that item only; sibling checkers are unaffected.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{CheckInput, Checker, Finding, Inspector, ServiceType};
use crate::cloud::CloudSession;
use crate::error::{CheckerError, InspectorError};

const COLLECTED_PERCENT: u8 = 20;
const CHECKS_DONE_PERCENT: u8 = 90;

/// Execution limits for one inspector run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    /// Expiry of the federated credential; no checker is dispatched after it.
    pub credential_expiry: DateTime<Utc>,
    pub call_timeout: Duration,
    pub max_concurrency: usize,
}

impl RunContext {
    fn credential_expired(&self) -> bool {
        Utc::now() >= self.credential_expiry
    }
}

/// Local progress reported by the runner, 0-100 within this inspector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectorProgress {
    pub service_type: ServiceType,
    pub percent: u8,
    pub step: String,
}

/// Why an item was never evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    CollectionFailed(String),
    Cancelled,
    CredentialExpired,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CollectionFailed(message) => write!(f, "data collection failed: {message}"),
            Self::Cancelled => write!(f, "inspection cancelled before this item ran"),
            Self::CredentialExpired => write!(f, "session credential expired before this item ran"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemRunState {
    Checked,
    /// The checker failed; findings hold one synthetic failure finding.
    CheckerFailed(String),
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub item_id: String,
    pub findings: Vec<Finding>,
    pub state: ItemRunState,
}

impl ItemOutcome {
    fn skipped(item_id: &str, reason: SkipReason) -> Self {
        Self {
            item_id: item_id.to_string(),
            findings: Vec::new(),
            state: ItemRunState::Skipped(reason),
        }
    }
}

/// Result of one inspector run, items in selection order.
#[derive(Debug)]
pub struct InspectorRun {
    pub service_type: ServiceType,
    pub items: Vec<ItemOutcome>,
    pub resource_counts: BTreeMap<String, usize>,
    pub collection_error: Option<InspectorError>,
}

struct Progress {
    service_type: ServiceType,
    sink: mpsc::UnboundedSender<InspectorProgress>,
    last: u8,
}

impl Progress {
    fn emit(&mut self, percent: u8, step: String) {
        let percent = percent.clamp(self.last, 100);
        self.last = percent;
        // The orchestrator may have stopped listening; progress is advisory.
        let _ = self.sink.send(InspectorProgress {
            service_type: self.service_type,
            percent,
            step,
        });
    }
}

/// Run `inspector` over `selected` items.
///
/// Never fails: collection failures, cancellation, and expiry mark items
/// skipped; checker failures become synthetic findings.
pub async fn run_inspector(
    inspector: Arc<dyn Inspector>,
    session: Arc<dyn CloudSession>,
    selected: &[String],
    ctx: &RunContext,
    sink: mpsc::UnboundedSender<InspectorProgress>,
) -> InspectorRun {
    let service = inspector.service_type();
    let mut progress = Progress {
        service_type: service,
        sink,
        last: 0,
    };
    let mut run = InspectorRun {
        service_type: service,
        items: Vec::new(),
        resource_counts: BTreeMap::new(),
        collection_error: None,
    };

    progress.emit(0, format!("collecting {service} inventory"));

    let pre_check = if ctx.cancel.is_cancelled() {
        Some(SkipReason::Cancelled)
    } else if ctx.credential_expired() {
        Some(SkipReason::CredentialExpired)
    } else {
        None
    };
    if let Some(reason) = pre_check {
        run.items = selected
            .iter()
            .map(|item| ItemOutcome::skipped(item, reason.clone()))
            .collect();
        return run;
    }

    let collected =
        match tokio::time::timeout(call_timeout(ctx), inspector.collect(session.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(InspectorError::Timeout {
                service: service.to_string(),
            }),
        };
    let inventory = match collected {
        Ok(inventory) => inventory,
        Err(e) => {
            tracing::warn!(service = %service, error = %e, "inventory collection failed");
            let reason = SkipReason::CollectionFailed(e.to_string());
            run.items = selected
                .iter()
                .map(|item| ItemOutcome::skipped(item, reason.clone()))
                .collect();
            run.collection_error = Some(e);
            return run;
        }
    };
    run.resource_counts = inventory.resource_counts();
    progress.emit(COLLECTED_PERCENT, format!("collected {service} inventory"));

    let input = Arc::new(CheckInput { inventory, session });
    let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; selected.len()];
    let mut in_flight: HashMap<usize, String> = HashMap::new();
    let mut tasks: JoinSet<(usize, Result<Vec<Finding>, CheckerError>)> = JoinSet::new();
    let max_concurrency = ctx.max_concurrency.max(1);
    let total = selected.len().max(1);
    let mut next = 0;
    let mut finished = 0;
    let mut stop: Option<SkipReason> = None;

    loop {
        while stop.is_none() && next < selected.len() && in_flight.len() < max_concurrency {
            if ctx.cancel.is_cancelled() {
                stop = Some(SkipReason::Cancelled);
                break;
            }
            if ctx.credential_expired() {
                stop = Some(SkipReason::CredentialExpired);
                break;
            }

            let item_id = selected[next].clone();
            match inspector.checker(&item_id) {
                Some(checker) => {
                    tracing::debug!(service = %service, item = %item_id, "dispatching checker");
                    in_flight.insert(next, item_id);
                    tasks.spawn(isolated_check(
                        next,
                        checker,
                        Arc::clone(&input),
                        call_timeout(ctx),
                    ));
                }
                None => {
                    outcomes[next] = Some(failed_outcome(
                        service,
                        &item_id,
                        CheckerError::Other(format!("no checker registered for '{item_id}'")),
                    ));
                    finished += 1;
                }
            }
            next += 1;
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((index, result)) => {
                let item_id = in_flight.remove(&index).unwrap_or_default();
                outcomes[index] = Some(match result {
                    Ok(findings) => ItemOutcome {
                        item_id: item_id.clone(),
                        findings,
                        state: ItemRunState::Checked,
                    },
                    Err(e) => failed_outcome(service, &item_id, e),
                });
                finished += 1;
                let percent = COLLECTED_PERCENT as usize
                    + (CHECKS_DONE_PERCENT - COLLECTED_PERCENT) as usize * finished / total;
                progress.emit(percent as u8, format!("checked {service} {item_id}"));
            }
            Err(e) => {
                // The wrapper task itself died; its item is recovered below.
                tracing::error!(service = %service, error = %e, "checker task aborted");
            }
        }
    }

    if let Some(reason) = stop {
        tracing::info!(service = %service, reason = %reason, "stopped dispatching checkers");
        for index in next..selected.len() {
            outcomes[index] = Some(ItemOutcome::skipped(&selected[index], reason.clone()));
        }
    }

    run.items = outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            outcome.unwrap_or_else(|| {
                failed_outcome(
                    service,
                    &selected[index],
                    CheckerError::Other("checker task aborted".into()),
                )
            })
        })
        .collect();

    progress.emit(CHECKS_DONE_PERCENT, format!("finalizing {service} results"));
    progress.emit(100, format!("{service} inspection finished"));
    run
}

/// Per-call timeout, never past the credential expiry.
fn call_timeout(ctx: &RunContext) -> Duration {
    let remaining = (ctx.credential_expiry - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    ctx.call_timeout.min(remaining)
}

/// Runs one checker in a nested task so a panic is reported against its item.
async fn isolated_check(
    index: usize,
    checker: Arc<dyn Checker>,
    input: Arc<CheckInput>,
    timeout: Duration,
) -> (usize, Result<Vec<Finding>, CheckerError>) {
    let handle = tokio::spawn(async move {
        match tokio::time::timeout(timeout, checker.run(&input)).await {
            Ok(result) => result,
            Err(_) => Err(CheckerError::Timeout(timeout)),
        }
    });

    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(CheckerError::Panicked(e.to_string())),
    };

    let result = result.and_then(|findings| {
        for finding in &findings {
            finding.validate().map_err(CheckerError::InvalidFinding)?;
        }
        Ok(findings)
    });

    (index, result)
}

fn failed_outcome(service: ServiceType, item_id: &str, error: CheckerError) -> ItemOutcome {
    tracing::warn!(service = %service, item = %item_id, error = %error, "checker failed");
    let message = error.to_string();
    ItemOutcome {
        item_id: item_id.to_string(),
        findings: vec![Finding::inspection_failure(
            service.as_str(),
            item_id,
            &message,
        )],
        state: ItemRunState::CheckerFailed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Bucket, IamUser, Instance, PasswordPolicy, ResourceInventory, SecurityGroup};
    use crate::error::CloudError;
    use crate::inspect::{ItemDefinition, RiskLevel};
    use async_trait::async_trait;

    struct EmptySession;

    #[async_trait]
    impl CloudSession for EmptySession {
        async fn list_buckets(&self) -> Result<Vec<Bucket>, CloudError> {
            Ok(vec![])
        }
        async fn bucket_policy_is_public(&self, _: &str) -> Result<bool, CloudError> {
            Ok(false)
        }
        async fn list_instances(&self) -> Result<Vec<Instance>, CloudError> {
            Ok(vec![])
        }
        async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>, CloudError> {
            Ok(vec![])
        }
        async fn list_users(&self) -> Result<Vec<IamUser>, CloudError> {
            Ok(vec![])
        }
        async fn password_policy(&self) -> Result<Option<PasswordPolicy>, CloudError> {
            Ok(None)
        }
    }

    enum Behavior {
        Pass,
        Fail,
        Panic,
        Hang,
        BlankResource,
    }

    struct FakeChecker {
        id: &'static str,
        behavior: Behavior,
    }

    #[async_trait]
    impl Checker for FakeChecker {
        fn item(&self) -> ItemDefinition {
            ItemDefinition {
                id: self.id,
                title: self.id,
                category: "test",
                default_risk: RiskLevel::Low,
            }
        }

        async fn run(&self, _: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
            match self.behavior {
                Behavior::Pass => Ok(vec![Finding::pass("r1", "thing", "test", "ok")]),
                Behavior::Fail => Err(CheckerError::Cloud(CloudError::call("GetThing", "boom"))),
                Behavior::Panic => panic!("checker bug"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(vec![])
                }
                Behavior::BlankResource => Ok(vec![Finding::pass("", "thing", "test", "ok")]),
            }
        }
    }

    #[derive(Clone, Copy)]
    enum Collection {
        Ok,
        Fail,
        Hang,
    }

    struct FakeInspector {
        checkers: Vec<Arc<dyn Checker>>,
        collection: Collection,
    }

    impl FakeInspector {
        fn new(checkers: Vec<(&'static str, Behavior)>) -> Arc<Self> {
            Arc::new(Self {
                checkers: checkers
                    .into_iter()
                    .map(|(id, behavior)| Arc::new(FakeChecker { id, behavior }) as Arc<dyn Checker>)
                    .collect(),
                collection: Collection::Ok,
            })
        }
    }

    #[async_trait]
    impl Inspector for FakeInspector {
        fn service_type(&self) -> ServiceType {
            ServiceType::Storage
        }
        fn version(&self) -> &'static str {
            "test"
        }
        fn checkers(&self) -> &[Arc<dyn Checker>] {
            &self.checkers
        }
        async fn collect(&self, _: &dyn CloudSession) -> Result<ResourceInventory, InspectorError> {
            match self.collection {
                Collection::Ok => Ok(ResourceInventory::default()),
                Collection::Fail => Err(InspectorError::Collection {
                    service: "storage".into(),
                    source: CloudError::call("ListBuckets", "denied"),
                }),
                Collection::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(ResourceInventory::default())
                }
            }
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            cancel: CancellationToken::new(),
            credential_expiry: Utc::now() + chrono::Duration::minutes(10),
            call_timeout: Duration::from_millis(200),
            max_concurrency: 2,
        }
    }

    fn items(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    async fn run(
        inspector: Arc<FakeInspector>,
        selected: &[&str],
        ctx: &RunContext,
    ) -> (InspectorRun, Vec<InspectorProgress>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let run = run_inspector(inspector, Arc::new(EmptySession), &items(selected), ctx, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (run, events)
    }

    #[tokio::test]
    async fn one_failing_checker_does_not_abort_siblings() {
        let inspector = FakeInspector::new(vec![
            ("a", Behavior::Pass),
            ("b", Behavior::Fail),
            ("c", Behavior::Panic),
            ("d", Behavior::Pass),
        ]);
        let (run, _) = run(inspector, &["a", "b", "c", "d"], &ctx()).await;
        let states: Vec<_> = run.items.iter().map(|i| i.state.clone()).collect();
        assert_eq!(states[0], ItemRunState::Checked);
        assert!(matches!(states[1], ItemRunState::CheckerFailed(_)));
        assert!(matches!(states[2], ItemRunState::CheckerFailed(_)));
        assert_eq!(states[3], ItemRunState::Checked);
        assert!(run.items[2].findings[0].is_synthetic());
    }

    #[tokio::test]
    async fn hanging_checker_times_out() {
        let inspector = FakeInspector::new(vec![("slow", Behavior::Hang), ("ok", Behavior::Pass)]);
        let (run, _) = run(inspector, &["slow", "ok"], &ctx()).await;
        match &run.items[0].state {
            ItemRunState::CheckerFailed(message) => assert!(message.contains("timed out")),
            other => panic!("unexpected state {other:?}"),
        }
        assert_eq!(run.items[1].state, ItemRunState::Checked);
    }

    #[tokio::test]
    async fn blank_resource_id_is_contract_violation() {
        let inspector = FakeInspector::new(vec![("bad", Behavior::BlankResource)]);
        let (run, _) = run(inspector, &["bad"], &ctx()).await;
        assert!(matches!(run.items[0].state, ItemRunState::CheckerFailed(_)));
    }

    #[tokio::test]
    async fn collection_failure_skips_every_item() {
        let inspector = Arc::new(FakeInspector {
            checkers: FakeInspector::new(vec![("a", Behavior::Pass)]).checkers.clone(),
            collection: Collection::Fail,
        });
        let (run, _) = run(inspector, &["a"], &ctx()).await;
        assert!(run.collection_error.is_some());
        assert!(matches!(
            run.items[0].state,
            ItemRunState::Skipped(SkipReason::CollectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_run_dispatches_nothing() {
        let inspector = FakeInspector::new(vec![("a", Behavior::Pass), ("b", Behavior::Pass)]);
        let ctx = ctx();
        ctx.cancel.cancel();
        let (run, _) = run(inspector, &["a", "b"], &ctx).await;
        assert!(run
            .items
            .iter()
            .all(|i| i.state == ItemRunState::Skipped(SkipReason::Cancelled)));
    }

    #[tokio::test]
    async fn expired_credential_skips_items() {
        let inspector = FakeInspector::new(vec![("a", Behavior::Pass)]);
        let mut ctx = ctx();
        ctx.credential_expiry = Utc::now() - chrono::Duration::seconds(1);
        let (run, _) = run(inspector, &["a"], &ctx).await;
        assert_eq!(
            run.items[0].state,
            ItemRunState::Skipped(SkipReason::CredentialExpired)
        );
    }

    #[tokio::test]
    async fn collection_is_cut_off_at_credential_expiry() {
        let inspector = Arc::new(FakeInspector {
            checkers: FakeInspector::new(vec![("a", Behavior::Pass)]).checkers.clone(),
            collection: Collection::Hang,
        });
        let mut ctx = ctx();
        ctx.call_timeout = Duration::from_secs(30);
        ctx.credential_expiry = Utc::now() + chrono::Duration::milliseconds(150);

        let started = std::time::Instant::now();
        let (run, _) = run(inspector, &["a"], &ctx).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            run.collection_error,
            Some(InspectorError::Timeout { .. })
        ));
        assert!(matches!(
            run.items[0].state,
            ItemRunState::Skipped(SkipReason::CollectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_100() {
        let inspector = FakeInspector::new(vec![
            ("a", Behavior::Pass),
            ("b", Behavior::Fail),
            ("c", Behavior::Pass),
        ]);
        let (_, events) = run(inspector, &["a", "b", "c"], &ctx()).await;
        let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
    }
}

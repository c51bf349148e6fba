#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{watch, Notify};

use cloudaudit::cloud::{
    Bucket, CloudConnector, CloudSession, IamUser, Instance, PasswordPolicy, ResourceInventory,
    SecurityGroup,
};
use cloudaudit::error::{CheckerError, CloudError, FederationError, InspectorError, StoreError};
use cloudaudit::federation::{
    Credential, CredentialFederator, FederationRequest, RetryPolicy, TrustBroker,
};
use cloudaudit::inspect::{
    CheckInput, Checker, Finding, Inspector, InspectorRegistry, ItemDefinition, RiskLevel,
    ServiceType,
};
use cloudaudit::orchestrator::{ExecutionSettings, InspectionService};
use cloudaudit::progress::ProgressBroadcaster;
use cloudaudit::store::memory::InMemoryTable;
use cloudaudit::store::{KvTable, ResultStore, TableRecord};

pub const ROLE: &str = "arn:aws:iam::123456789012:role/AuditRole";
pub const CUSTOMER: &str = "acme";

/// Cloud session over fixed buckets with switchable failures.
#[derive(Default)]
pub struct ScriptedSession {
    pub buckets: Vec<Bucket>,
    pub fail_policy_lookup: bool,
    pub fail_bucket_listing: bool,
}

impl ScriptedSession {
    /// `logs` is unencrypted, `assets` is encrypted; both block public access.
    pub fn two_buckets() -> Self {
        Self {
            buckets: vec![bucket("logs", None), bucket("assets", Some("aws:kms"))],
            ..Default::default()
        }
    }
}

pub fn bucket(name: &str, encryption: Option<&str>) -> Bucket {
    Bucket {
        name: name.into(),
        region: "eu-west-1".into(),
        public_access_blocked: true,
        encryption: encryption.map(str::to_string),
        versioning_enabled: true,
    }
}

#[async_trait]
impl CloudSession for ScriptedSession {
    async fn list_buckets(&self) -> Result<Vec<Bucket>, CloudError> {
        if self.fail_bucket_listing {
            return Err(CloudError::AccessDenied {
                operation: "ListBuckets".into(),
            });
        }
        Ok(self.buckets.clone())
    }

    async fn bucket_policy_is_public(&self, bucket: &str) -> Result<bool, CloudError> {
        if self.fail_policy_lookup {
            return Err(CloudError::call(
                "GetBucketPolicyStatus",
                format!("service unavailable for {bucket}"),
            ));
        }
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

pub struct FixedConnector(pub Arc<dyn CloudSession>);

impl CloudConnector for FixedConnector {
    fn connect(&self, _: &Credential) -> Result<Arc<dyn CloudSession>, CloudError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Issues credentials with a fixed lifetime once its gate is open.
pub struct GatedBroker {
    gate: watch::Receiver<bool>,
    lifetime: chrono::Duration,
}

#[async_trait]
impl TrustBroker for GatedBroker {
    async fn assume_role(&self, request: &FederationRequest) -> Result<Credential, FederationError> {
        let mut gate = self.gate.clone();
        gate.wait_for(|open| *open)
            .await
            .map_err(|_| FederationError::transient("gate dropped"))?;
        Ok(Credential {
            access_key_id: format!("ASIA{}", request.role.account_id),
            secret_access_key: "secret".into(),
            session_token: "token".into(),
            expiry: Utc::now() + self.lifetime,
        })
    }
}

/// In-memory table that can refuse the LATEST write of one item.
#[derive(Default)]
pub struct FaultyTable {
    pub inner: InMemoryTable,
    fail_latest: Mutex<Option<String>>,
}

impl FaultyTable {
    /// Fail every write to this exact LATEST sort key until cleared.
    pub fn fail_latest_write(&self, sort_key: Option<String>) {
        *self.fail_latest.lock().unwrap() = sort_key;
    }
}

#[async_trait]
impl KvTable for FaultyTable {
    async fn put(&self, record: TableRecord) -> Result<(), StoreError> {
        let refused = self.fail_latest.lock().unwrap().as_deref() == Some(record.sort.as_str());
        if refused {
            return Err(StoreError::Write {
                key: record.sort,
                message: "injected failure".into(),
            });
        }
        self.inner.put(record).await
    }

    async fn get(&self, partition: &str, sort: &str) -> Result<Option<TableRecord>, StoreError> {
        self.inner.get(partition, sort).await
    }

    async fn query_prefix(
        &self,
        partition: &str,
        prefix: &str,
    ) -> Result<Vec<TableRecord>, StoreError> {
        self.inner.query_prefix(partition, prefix).await
    }

    async fn query_index(&self, partition: &str) -> Result<Vec<TableRecord>, StoreError> {
        self.inner.query_index(partition).await
    }
}

#[derive(Clone)]
pub enum Behavior {
    Pass,
    Issue(RiskLevel),
    Fail,
    Panic,
    Sleep(Duration),
    /// Notify, then sleep.
    Signal(Arc<Notify>, Duration),
}

pub struct ScriptedChecker {
    pub id: &'static str,
    pub behavior: Behavior,
}

#[async_trait]
impl Checker for ScriptedChecker {
    fn item(&self) -> ItemDefinition {
        ItemDefinition {
            id: self.id,
            title: self.id,
            category: "scripted",
            default_risk: RiskLevel::Medium,
        }
    }

    async fn run(&self, _: &CheckInput) -> Result<Vec<Finding>, CheckerError> {
        let resource = format!("{}-resource", self.id);
        match &self.behavior {
            Behavior::Pass => Ok(vec![Finding::pass(resource, "thing", "scripted", "ok")]),
            Behavior::Issue(risk) => Ok(vec![Finding::new(
                resource,
                "thing",
                *risk,
                format!("{} found an issue", self.id),
                "fix it",
                "scripted",
            )]),
            Behavior::Fail => Err(CheckerError::Cloud(CloudError::Throttled {
                operation: "Describe".into(),
            })),
            Behavior::Panic => panic!("scripted checker bug"),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(vec![Finding::pass(resource, "thing", "scripted", "ok")])
            }
            Behavior::Signal(notify, duration) => {
                notify.notify_one();
                tokio::time::sleep(*duration).await;
                Ok(vec![Finding::pass(resource, "thing", "scripted", "ok")])
            }
        }
    }
}

/// Inspector for `service` made of scripted checkers.
pub struct ScriptedInspector {
    pub service: ServiceType,
    pub checkers: Vec<Arc<dyn Checker>>,
}

impl ScriptedInspector {
    pub fn new(service: ServiceType, checkers: Vec<(&'static str, Behavior)>) -> Arc<Self> {
        Arc::new(Self {
            service,
            checkers: checkers
                .into_iter()
                .map(|(id, behavior)| Arc::new(ScriptedChecker { id, behavior }) as Arc<dyn Checker>)
                .collect(),
        })
    }
}

#[async_trait]
impl Inspector for ScriptedInspector {
    fn service_type(&self) -> ServiceType {
        self.service
    }

    fn version(&self) -> &'static str {
        "scripted"
    }

    fn checkers(&self) -> &[Arc<dyn Checker>] {
        &self.checkers
    }

    async fn collect(&self, _: &dyn CloudSession) -> Result<ResourceInventory, InspectorError> {
        Ok(ResourceInventory::default())
    }
}

pub struct Setup {
    pub session: ScriptedSession,
    pub registry: InspectorRegistry,
    pub credential_lifetime: chrono::Duration,
    pub gated: bool,
    pub max_concurrency: usize,
    pub checker_timeout: Duration,
    pub federation_timeout: Duration,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            session: ScriptedSession::two_buckets(),
            registry: InspectorRegistry::builtin(),
            credential_lifetime: chrono::Duration::minutes(30),
            gated: false,
            max_concurrency: 4,
            checker_timeout: Duration::from_secs(2),
            federation_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Harness {
    pub service: InspectionService,
    pub table: Arc<FaultyTable>,
    pub gate: watch::Sender<bool>,
}

impl Harness {
    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }
}

impl Setup {
    pub fn build(self) -> Harness {
        let (gate, gate_rx) = watch::channel(!self.gated);
        let broker = Arc::new(GatedBroker {
            gate: gate_rx,
            lifetime: self.credential_lifetime,
        });
        let federator = CredentialFederator::new(
            broker,
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                attempt_timeout: self.federation_timeout,
            },
            Duration::from_secs(900),
        );
        let table = Arc::new(FaultyTable::default());
        let service = InspectionService::new(
            self.registry,
            federator,
            Arc::new(FixedConnector(Arc::new(self.session))),
            ResultStore::new(table.clone()),
            Arc::new(ProgressBroadcaster::new(64)),
            ExecutionSettings {
                checker_timeout: self.checker_timeout,
                max_concurrent_checkers: self.max_concurrency,
                external_id: None,
            },
        );
        Harness {
            service,
            table,
            gate,
        }
    }
}

pub fn harness() -> Harness {
    Setup::default().build()
}

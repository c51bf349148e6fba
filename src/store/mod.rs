//! Durable inspection results in a single shared key-value table.
//!
//! Every committed item is written twice: an append-only HISTORY record and
//! an overwritten LATEST record carrying the same payload. The pair is not
//! transactional. HISTORY is always written first, so a failure between the
//! two writes leaves LATEST stale, never ahead; stale LATEST records are
//! detected and rebuilt from the newest HISTORY record on read.

pub mod keys;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::inspect::{Finding, ItemStatus, RiskLevel, ServiceType};
use crate::orchestrator::job::{Inspection, InspectionId};

/// One row of the shared table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRecord {
    pub partition: String,
    pub sort: String,
    /// Secondary index attribute `(partition, index_time)`. Sparse: only rows
    /// that set it appear in [`KvTable::query_index`].
    pub index_time: Option<DateTime<Utc>>,
    pub payload: Value,
}

/// Minimal single-table key-value store.
#[async_trait]
pub trait KvTable: Send + Sync {
    /// Insert or overwrite the row at `(partition, sort)`.
    async fn put(&self, record: TableRecord) -> Result<(), StoreError>;

    async fn get(&self, partition: &str, sort: &str) -> Result<Option<TableRecord>, StoreError>;

    /// Rows of `partition` whose sort key starts with `prefix`, ascending.
    async fn query_prefix(&self, partition: &str, prefix: &str)
        -> Result<Vec<TableRecord>, StoreError>;

    /// Rows of `partition` carrying an index time, newest first.
    async fn query_index(&self, partition: &str) -> Result<Vec<TableRecord>, StoreError>;
}

/// Durable result of one item in one inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionItemResult {
    pub customer_id: String,
    pub service_type: ServiceType,
    pub item_id: String,
    pub status: ItemStatus,
    pub total_resources: usize,
    pub issues_found: usize,
    pub risk_level: RiskLevel,
    pub score: u8,
    pub findings: Vec<Finding>,
    pub recommendations: Vec<String>,
    pub last_inspection_id: InspectionId,
    pub last_inspection_time: DateTime<Utc>,
}

impl InspectionItemResult {
    fn is_newer_than(&self, other: &Self) -> bool {
        (self.last_inspection_time, self.last_inspection_id.to_string())
            > (other.last_inspection_time, other.last_inspection_id.to_string())
    }
}

/// Filter for history scans.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub customer_id: String,
    pub service_type: Option<ServiceType>,
    pub item_id: Option<String>,
    pub limit: Option<usize>,
}

/// How the LATEST record of an item relates to its newest HISTORY record.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Neither record exists.
    Empty,
    Consistent(InspectionItemResult),
    /// LATEST is missing or stale; the value is the newest HISTORY record.
    Stale(InspectionItemResult),
}

/// Compare an item's LATEST record against its HISTORY records.
pub fn reconcile(
    latest: Option<InspectionItemResult>,
    history: &[InspectionItemResult],
) -> Reconciliation {
    let newest = history
        .iter()
        .fold(None::<&InspectionItemResult>, |best, candidate| match best {
            Some(best) if !candidate.is_newer_than(best) => Some(best),
            _ => Some(candidate),
        });

    match (latest, newest) {
        (None, None) => Reconciliation::Empty,
        (Some(latest), None) => Reconciliation::Consistent(latest),
        (None, Some(newest)) => Reconciliation::Stale(newest.clone()),
        (Some(latest), Some(newest)) => {
            if latest == *newest {
                Reconciliation::Consistent(latest)
            } else if latest.is_newer_than(newest) {
                // Not produced by the commit protocol; keep what is there.
                tracing::warn!(
                    item = %latest.item_id,
                    latest = %latest.last_inspection_id,
                    "latest record has no matching history entry"
                );
                Reconciliation::Consistent(latest)
            } else {
                Reconciliation::Stale(newest.clone())
            }
        }
    }
}

/// Dual-view result store over a [`KvTable`].
#[derive(Clone)]
pub struct ResultStore {
    table: Arc<dyn KvTable>,
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore").finish_non_exhaustive()
    }
}

impl ResultStore {
    pub fn new(table: Arc<dyn KvTable>) -> Self {
        Self { table }
    }

    /// Commit one item: HISTORY first, then LATEST with the identical payload.
    ///
    /// `customer_id` and `inspection_id` override whatever the result carries.
    pub async fn commit_item_result(
        &self,
        customer_id: &str,
        inspection_id: InspectionId,
        result: &InspectionItemResult,
    ) -> Result<(), StoreError> {
        let mut result = result.clone();
        result.customer_id = customer_id.to_string();
        result.last_inspection_id = inspection_id;

        let history_key = keys::history(result.service_type, &result.item_id, inspection_id);
        let payload = encode(&history_key, &result)?;

        self.table
            .put(TableRecord {
                partition: customer_id.to_string(),
                sort: history_key,
                index_time: Some(result.last_inspection_time),
                payload: payload.clone(),
            })
            .await?;

        self.table
            .put(TableRecord {
                partition: customer_id.to_string(),
                sort: keys::latest(result.service_type, &result.item_id),
                index_time: None,
                payload,
            })
            .await?;

        tracing::debug!(
            customer = customer_id,
            inspection_id = %inspection_id,
            service = %result.service_type,
            item = %result.item_id,
            "committed item result"
        );
        Ok(())
    }

    /// Current status of one item, repairing a stale LATEST record.
    pub async fn latest_item(
        &self,
        customer_id: &str,
        service: ServiceType,
        item_id: &str,
    ) -> Result<Option<InspectionItemResult>, StoreError> {
        let rows = self
            .table
            .query_prefix(customer_id, &keys::item_prefix(service, item_id))
            .await?;
        let (latest, history) = split_item_rows(rows)?;
        self.settle(customer_id, latest, &history).await
    }

    /// LATEST view of every item of a customer, grouped by service then item.
    pub async fn items_status(
        &self,
        customer_id: &str,
    ) -> Result<BTreeMap<ServiceType, BTreeMap<String, InspectionItemResult>>, StoreError> {
        let mut out = BTreeMap::new();

        for service in ServiceType::ALL {
            let rows = self
                .table
                .query_prefix(customer_id, &keys::service_prefix(service))
                .await?;

            let mut per_item: BTreeMap<String, Vec<TableRecord>> = BTreeMap::new();
            for row in rows {
                let item_id = item_id_of(service, &row.sort);
                per_item.entry(item_id).or_default().push(row);
            }

            let mut items = BTreeMap::new();
            for (item_id, rows) in per_item {
                let (latest, history) = split_item_rows(rows)?;
                if let Some(result) = self.settle(customer_id, latest, &history).await? {
                    items.insert(item_id, result);
                }
            }
            if !items.is_empty() {
                out.insert(service, items);
            }
        }

        Ok(out)
    }

    /// HISTORY records, newest first.
    pub async fn history(
        &self,
        query: &HistoryQuery,
    ) -> Result<Vec<InspectionItemResult>, StoreError> {
        let mut results = match (query.service_type, &query.item_id) {
            (Some(service), Some(item_id)) => {
                let rows = self
                    .table
                    .query_prefix(&query.customer_id, &keys::item_prefix(service, item_id))
                    .await?;
                let (_, mut history) = split_item_rows(rows)?;
                history.sort_by(|a, b| {
                    if a.is_newer_than(b) {
                        std::cmp::Ordering::Less
                    } else if b.is_newer_than(a) {
                        std::cmp::Ordering::Greater
                    } else {
                        std::cmp::Ordering::Equal
                    }
                });
                history
            }
            _ => {
                let rows = self.table.query_index(&query.customer_id).await?;
                let mut results = Vec::with_capacity(rows.len());
                for row in rows {
                    let result: InspectionItemResult = decode(&row)?;
                    let service_matches = query
                        .service_type
                        .map_or(true, |service| service == result.service_type);
                    let item_matches = query
                        .item_id
                        .as_deref()
                        .map_or(true, |item| item == result.item_id);
                    if service_matches && item_matches {
                        results.push(result);
                    }
                }
                results
            }
        };

        if let Some(limit) = query.limit {
            results.truncate(limit);
        }
        Ok(results)
    }

    pub async fn save_inspection(&self, inspection: &Inspection) -> Result<(), StoreError> {
        let sort = keys::inspection(inspection.inspection_id);
        let payload = encode(&sort, inspection)?;
        self.table
            .put(TableRecord {
                partition: inspection.customer_id.clone(),
                sort,
                index_time: None,
                payload,
            })
            .await
    }

    pub async fn load_inspection(
        &self,
        customer_id: &str,
        inspection_id: InspectionId,
    ) -> Result<Option<Inspection>, StoreError> {
        self.table
            .get(customer_id, &keys::inspection(inspection_id))
            .await?
            .map(|row| decode(&row))
            .transpose()
    }

    /// Job records of a customer, newest first.
    pub async fn list_inspections(&self, customer_id: &str) -> Result<Vec<Inspection>, StoreError> {
        let rows = self
            .table
            .query_prefix(customer_id, keys::INSPECTION_PREFIX)
            .await?;
        let mut inspections = rows
            .iter()
            .map(decode::<Inspection>)
            .collect::<Result<Vec<_>, _>>()?;
        inspections.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(inspections)
    }

    /// Resolve an item's current status, rewriting LATEST when stale.
    async fn settle(
        &self,
        customer_id: &str,
        latest: Option<InspectionItemResult>,
        history: &[InspectionItemResult],
    ) -> Result<Option<InspectionItemResult>, StoreError> {
        let stale_id = latest.as_ref().map(|l| l.last_inspection_id);
        match reconcile(latest, history) {
            Reconciliation::Empty => Ok(None),
            Reconciliation::Consistent(result) => Ok(Some(result)),
            Reconciliation::Stale(newest) => {
                tracing::warn!(
                    customer = customer_id,
                    service = %newest.service_type,
                    item = %newest.item_id,
                    stale = ?stale_id.map(|id| id.to_string()),
                    newest = %newest.last_inspection_id,
                    "repairing stale latest record from history"
                );
                let sort = keys::latest(newest.service_type, &newest.item_id);
                let payload = encode(&sort, &newest)?;
                self.table
                    .put(TableRecord {
                        partition: customer_id.to_string(),
                        sort,
                        index_time: None,
                        payload,
                    })
                    .await?;
                Ok(Some(newest))
            }
        }
    }
}

/// Split the rows under one item prefix into its LATEST and HISTORY records.
fn split_item_rows(
    rows: Vec<TableRecord>,
) -> Result<(Option<InspectionItemResult>, Vec<InspectionItemResult>), StoreError> {
    let mut latest = None;
    let mut history = Vec::new();
    for row in rows {
        let result: InspectionItemResult = decode(&row)?;
        if keys::is_latest(&row.sort) {
            latest = Some(result);
        } else {
            history.push(result);
        }
    }
    Ok((latest, history))
}

/// Item id embedded in a `{service}#{item}#...` sort key.
fn item_id_of(service: ServiceType, sort: &str) -> String {
    let rest = sort
        .strip_prefix(&keys::service_prefix(service))
        .unwrap_or(sort);
    rest.rsplit_once('#')
        .map(|(item, _)| item.to_string())
        .unwrap_or_else(|| rest.to_string())
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Write {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(row: &TableRecord) -> Result<T, StoreError> {
    serde_json::from_value(row.payload.clone()).map_err(|e| StoreError::Decode {
        key: format!("{}/{}", row.partition, row.sort),
        message: e.to_string(),
    })
}

//! In-process [`KvTable`] for tests and offline runs.
//!
//! Not durable: all rows are lost when the process exits.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{KvTable, TableRecord};
use crate::error::StoreError;

/// Rows ordered by `(partition, sort)`, so prefix scans are range scans.
#[derive(Debug, Default)]
pub struct InMemoryTable {
    rows: RwLock<BTreeMap<(String, String), TableRecord>>,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Poisoned
}

impl InMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of rows across all partitions.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.rows.read().map_err(poison_err)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl KvTable for InMemoryTable {
    async fn put(&self, record: TableRecord) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        rows.insert((record.partition.clone(), record.sort.clone()), record);
        Ok(())
    }

    async fn get(&self, partition: &str, sort: &str) -> Result<Option<TableRecord>, StoreError> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows
            .get(&(partition.to_string(), sort.to_string()))
            .cloned())
    }

    async fn query_prefix(
        &self,
        partition: &str,
        prefix: &str,
    ) -> Result<Vec<TableRecord>, StoreError> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows
            .range((partition.to_string(), prefix.to_string())..)
            .take_while(|((p, s), _)| p == partition && s.starts_with(prefix))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn query_index(&self, partition: &str) -> Result<Vec<TableRecord>, StoreError> {
        let rows = self.rows.read().map_err(poison_err)?;
        let mut indexed: Vec<TableRecord> = rows
            .range((partition.to_string(), String::new())..)
            .take_while(|((p, _), _)| p == partition)
            .filter(|(_, record)| record.index_time.is_some())
            .map(|(_, record)| record.clone())
            .collect();
        indexed.sort_by(|a, b| b.index_time.cmp(&a.index_time).then_with(|| b.sort.cmp(&a.sort)));
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn row(partition: &str, sort: &str, index_secs: Option<i64>) -> TableRecord {
        TableRecord {
            partition: partition.into(),
            sort: sort.into(),
            index_time: index_secs.map(|s| DateTime::<Utc>::from_timestamp(s, 0).unwrap()),
            payload: json!({ "sort": sort }),
        }
    }

    #[tokio::test]
    async fn put_overwrites_same_key() {
        let table = InMemoryTable::new();
        table.put(row("a", "k", None)).await.unwrap();
        let mut replacement = row("a", "k", None);
        replacement.payload = json!({ "v": 2 });
        table.put(replacement).await.unwrap();
        assert_eq!(table.len().unwrap(), 1);
        let stored = table.get("a", "k").await.unwrap().unwrap();
        assert_eq!(stored.payload["v"], 2);
    }

    #[tokio::test]
    async fn prefix_scan_stays_in_partition() {
        let table = InMemoryTable::new();
        for (p, s) in [("a", "x#1"), ("a", "x#2"), ("a", "y#1"), ("b", "x#3")] {
            table.put(row(p, s, None)).await.unwrap();
        }
        let rows = table.query_prefix("a", "x#").await.unwrap();
        let sorts: Vec<_> = rows.iter().map(|r| r.sort.as_str()).collect();
        assert_eq!(sorts, vec!["x#1", "x#2"]);
    }

    #[tokio::test]
    async fn index_is_sparse_and_newest_first() {
        let table = InMemoryTable::new();
        table.put(row("a", "h1", Some(10))).await.unwrap();
        table.put(row("a", "h2", Some(20))).await.unwrap();
        table.put(row("a", "latest", None)).await.unwrap();
        table.put(row("b", "h3", Some(30))).await.unwrap();
        let rows = table.query_index("a").await.unwrap();
        let sorts: Vec<_> = rows.iter().map(|r| r.sort.as_str()).collect();
        assert_eq!(sorts, vec!["h2", "h1"]);
    }
}

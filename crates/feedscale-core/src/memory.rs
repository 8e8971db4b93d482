//! In-Memory Change Feed
//!
//! `MemoryFeed` keeps every partition as a `Vec<Record>` and uses the record's index as
//! its position. Tokens are decimal strings naming the next index to read, so:
//!
//! - an empty partition has head `"0"`
//! - after appending 10 records the head is `"10"`
//! - `distance(Some("7"), "10") == 3`, `distance(None, "10") == 10`
//!
//! Partitions can be added and removed at runtime to mimic the log splitting or
//! merging shards, and faults can be injected to exercise error handling.
//!
//! ## Example
//!
//! ```ignore
//! let feed = MemoryFeed::with_partitions(["0", "1"]);
//! feed.append("0", None, Bytes::from("order-1")).await?;
//! let batch = feed.read_from("0", None, 100).await?;
//! assert_eq!(batch.continuation.as_str(), "1");
//! ```

use crate::error::{FeedError, Result};
use crate::feed::ChangeFeed;
use crate::record::{Batch, ContinuationToken, Partition, Record};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Fault injected into a `MemoryFeed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFault {
    /// Calls fail with `FeedError::Unavailable`
    Unavailable,
    /// Calls fail with `FeedError::Misconfigured`
    Misconfigured,
}

impl FeedFault {
    fn to_error(self, scope: &str) -> FeedError {
        match self {
            FeedFault::Unavailable => {
                FeedError::Unavailable(format!("injected outage for {}", scope))
            }
            FeedFault::Misconfigured => {
                FeedError::Misconfigured(format!("injected misconfiguration for {}", scope))
            }
        }
    }
}

#[derive(Default)]
struct FaultState {
    global: Option<FeedFault>,
    partitions: HashMap<String, FeedFault>,
}

/// In-memory partitioned log.
#[derive(Default)]
pub struct MemoryFeed {
    partitions: RwLock<BTreeMap<String, Vec<Record>>>,
    faults: RwLock<FaultState>,
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a feed with empty partitions.
    pub fn with_partitions<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let partitions = ids
            .into_iter()
            .map(|id| (id.into(), Vec::new()))
            .collect::<BTreeMap<_, _>>();

        Self {
            partitions: RwLock::new(partitions),
            faults: RwLock::new(FaultState::default()),
        }
    }

    /// Add an empty partition. No-op if it already exists.
    pub async fn add_partition(&self, partition_id: impl Into<String>) {
        self.partitions
            .write()
            .await
            .entry(partition_id.into())
            .or_default();
    }

    /// Drop a partition and all its records, as the log does when it retires a shard.
    pub async fn remove_partition(&self, partition_id: &str) -> bool {
        self.partitions.write().await.remove(partition_id).is_some()
    }

    /// Append a record and return its position.
    pub async fn append(
        &self,
        partition_id: &str,
        key: Option<Bytes>,
        value: Bytes,
    ) -> Result<ContinuationToken> {
        let mut partitions = self.partitions.write().await;
        let records = partitions
            .get_mut(partition_id)
            .ok_or_else(|| FeedError::PartitionNotFound(partition_id.to_string()))?;

        let position = ContinuationToken::new(records.len().to_string());
        records.push(Record::new(position.clone(), now_ms(), key, value));
        Ok(position)
    }

    /// Append `count` generated records to a partition.
    pub async fn append_many(&self, partition_id: &str, count: usize) -> Result<()> {
        for i in 0..count {
            self.append(partition_id, None, Bytes::from(format!("record-{}", i)))
                .await?;
        }
        Ok(())
    }

    /// Make calls touching `partition_id` fail.
    pub async fn inject_fault(&self, partition_id: &str, fault: FeedFault) {
        self.faults
            .write()
            .await
            .partitions
            .insert(partition_id.to_string(), fault);
    }

    /// Make every call fail, including `list_partitions`.
    pub async fn inject_global_fault(&self, fault: FeedFault) {
        self.faults.write().await.global = Some(fault);
    }

    pub async fn clear_faults(&self) {
        let mut faults = self.faults.write().await;
        faults.global = None;
        faults.partitions.clear();
    }

    async fn check_fault(&self, partition_id: Option<&str>) -> Result<()> {
        let faults = self.faults.read().await;
        if let Some(fault) = faults.global {
            return Err(fault.to_error("change feed"));
        }
        if let Some(id) = partition_id {
            if let Some(fault) = faults.partitions.get(id) {
                return Err(fault.to_error(&format!("partition {}", id)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn list_partitions(&self) -> Result<Vec<Partition>> {
        self.check_fault(None).await?;
        let partitions = self.partitions.read().await;
        Ok(partitions.keys().map(Partition::new).collect())
    }

    async fn read_from(
        &self,
        partition_id: &str,
        from: Option<&ContinuationToken>,
        max_items: usize,
    ) -> Result<Batch> {
        self.check_fault(Some(partition_id)).await?;

        let start = from.map(parse_offset).transpose()?.unwrap_or(0);
        let partitions = self.partitions.read().await;
        let records = partitions
            .get(partition_id)
            .ok_or_else(|| FeedError::PartitionNotFound(partition_id.to_string()))?;

        let start = start.min(records.len() as u64) as usize;
        let end = start.saturating_add(max_items).min(records.len());
        let batch = records[start..end].to_vec();

        Ok(Batch {
            partition_id: partition_id.to_string(),
            records: batch,
            continuation: ContinuationToken::new(end.to_string()),
        })
    }

    async fn head_position(&self, partition_id: &str) -> Result<ContinuationToken> {
        self.check_fault(Some(partition_id)).await?;
        let partitions = self.partitions.read().await;
        partitions
            .get(partition_id)
            .map(|records| ContinuationToken::new(records.len().to_string()))
            .ok_or_else(|| FeedError::PartitionNotFound(partition_id.to_string()))
    }

    fn distance(&self, from: Option<&ContinuationToken>, head: &ContinuationToken) -> Result<u64> {
        let from = from.map(parse_offset).transpose()?.unwrap_or(0);
        let head = parse_offset(head)?;
        Ok(head.saturating_sub(from))
    }
}

fn parse_offset(token: &ContinuationToken) -> Result<u64> {
    token
        .as_str()
        .parse::<u64>()
        .map_err(|_| FeedError::InvalidToken(token.to_string()))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_partitions_is_ordered() {
        let feed = MemoryFeed::with_partitions(["2", "0", "1"]);
        let ids: Vec<String> = feed
            .list_partitions()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.partition_id)
            .collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_read_preserves_order_across_batches() {
        let feed = MemoryFeed::with_partitions(["0"]);
        for i in 0..5 {
            feed.append("0", None, Bytes::from(format!("v{}", i)))
                .await
                .unwrap();
        }

        let first = feed.read_from("0", None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first.records[0].value, Bytes::from("v0"));
        assert_eq!(first.continuation.as_str(), "3");

        let second = feed
            .read_from("0", Some(&first.continuation), 3)
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second.records[0].value, Bytes::from("v3"));
        assert_eq!(second.continuation.as_str(), "5");

        let empty = feed
            .read_from("0", Some(&second.continuation), 3)
            .await
            .unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.continuation, second.continuation);
    }

    #[tokio::test]
    async fn test_head_and_distance() {
        let feed = MemoryFeed::with_partitions(["0"]);
        feed.append_many("0", 10).await.unwrap();

        let head = feed.head_position("0").await.unwrap();
        assert_eq!(head.as_str(), "10");
        assert_eq!(feed.distance(None, &head).unwrap(), 10);
        assert_eq!(feed.distance(Some(&"7".into()), &head).unwrap(), 3);
        // A checkpoint ahead of a stale head never produces a negative lag
        assert_eq!(feed.distance(Some(&"12".into()), &head).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_token() {
        let feed = MemoryFeed::with_partitions(["0"]);
        let err = feed
            .read_from("0", Some(&"not-a-number".into()), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_removed_partition_not_found() {
        let feed = MemoryFeed::with_partitions(["0", "1"]);
        assert!(feed.remove_partition("1").await);
        assert!(!feed.remove_partition("1").await);

        let err = feed.head_position("1").await.unwrap_err();
        assert_eq!(err, FeedError::PartitionNotFound("1".to_string()));
        assert_eq!(feed.list_partitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let feed = MemoryFeed::with_partitions(["0", "1"]);
        feed.inject_fault("1", FeedFault::Unavailable).await;

        assert!(feed.head_position("0").await.is_ok());
        assert!(feed.head_position("1").await.unwrap_err().is_transient());

        feed.inject_global_fault(FeedFault::Misconfigured).await;
        assert!(feed.list_partitions().await.unwrap_err().is_configuration());

        feed.clear_faults().await;
        assert!(feed.list_partitions().await.is_ok());
        assert!(feed.head_position("1").await.is_ok());
    }
}

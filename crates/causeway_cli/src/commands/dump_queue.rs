//! Dump queue command implementation.

use super::load_snapshot;
use causeway_sync_engine::{QueueSnapshot, QueueStatus, SyncQueueItem};
use serde::Serialize;
use std::path::Path;

const STATUSES: [QueueStatus; 5] = [
    QueueStatus::Pending,
    QueueStatus::InProgress,
    QueueStatus::Completed,
    QueueStatus::Failed,
    QueueStatus::Parked,
];

/// Queue item representation for output.
#[derive(Debug, Serialize)]
pub struct QueueItemInfo {
    /// Sequence number.
    pub seq: u64,
    /// Direction (outbound, inbound).
    pub direction: String,
    /// Priority.
    pub priority: String,
    /// Status.
    pub status: String,
    /// Entity key.
    pub entity: String,
    /// Operation id.
    pub op_id: String,
    /// Operation kind.
    pub kind: String,
    /// Originating replica.
    pub origin: String,
    /// Stamped version vector.
    pub vector: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Payload discarded on quarantine.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub payload_dropped: bool,
}

impl From<&SyncQueueItem> for QueueItemInfo {
    fn from(item: &SyncQueueItem) -> Self {
        Self {
            seq: item.seq,
            direction: format!("{:?}", item.direction).to_lowercase(),
            priority: format!("{:?}", item.priority).to_lowercase(),
            status: item.status.to_string(),
            entity: item.key().to_string(),
            op_id: item.operation.op_id.to_string(),
            kind: item.operation.kind.to_string(),
            origin: item.operation.origin.to_string(),
            vector: item.operation.vector.to_string(),
            retry_count: item.retry_count,
            last_error: item.last_error.clone(),
            payload_dropped: item.payload_dropped,
        }
    }
}

/// Runs the dump-queue command.
pub fn run(
    path: &Path,
    status: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = status.map(parse_status).transpose()?;
    let snapshot = load_snapshot(path)?;
    let items = collect_items(&snapshot, status, limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        _ => {
            print_text_output(&items);
        }
    }

    Ok(())
}

fn parse_status(name: &str) -> Result<QueueStatus, Box<dyn std::error::Error>> {
    STATUSES
        .into_iter()
        .find(|status| status.as_str() == name)
        .ok_or_else(|| format!("Unknown status {name:?}").into())
}

fn collect_items(
    snapshot: &QueueSnapshot,
    status: Option<QueueStatus>,
    limit: Option<usize>,
) -> Vec<QueueItemInfo> {
    snapshot
        .items()
        .filter(|item| status.map_or(true, |s| item.status == s))
        .take(limit.unwrap_or(usize::MAX))
        .map(QueueItemInfo::from)
        .collect()
}

fn print_text_output(items: &[QueueItemInfo]) {
    println!("Queue Items ({} total)", items.len());
    println!("================");
    println!();

    for item in items {
        print!(
            "[{:06}] {:8} {:8} {:11} {} {} op={}",
            item.seq,
            item.direction,
            item.priority,
            item.status,
            item.kind,
            item.entity,
            &item.op_id[..8.min(item.op_id.len())]
        );
        print!(" origin={} vv={}", item.origin, item.vector);
        if item.retry_count > 0 {
            print!(" retries={}", item.retry_count);
        }
        if let Some(ref error) = item.last_error {
            print!(" error={:?}", error);
        }
        if item.payload_dropped {
            print!(" payload=dropped");
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::write_sample_journal;

    #[test]
    fn filters_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.journal");
        write_sample_journal(&path);

        let snapshot = load_snapshot(&path).unwrap();
        assert_eq!(collect_items(&snapshot, None, None).len(), 3);

        let failed = collect_items(&snapshot, Some(QueueStatus::Failed), None);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].seq, 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("refused"));
        assert!(!failed[0].payload_dropped);
    }

    #[test]
    fn limit_applies_after_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.journal");
        write_sample_journal(&path);

        let snapshot = load_snapshot(&path).unwrap();
        let items = collect_items(&snapshot, Some(QueueStatus::Pending), Some(1));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].seq, 0);
        assert_eq!(items[0].direction, "outbound");
    }

    #[test]
    fn status_names() {
        assert_eq!(parse_status("in_progress").unwrap(), QueueStatus::InProgress);
        assert!(parse_status("done").is_err());
    }
}

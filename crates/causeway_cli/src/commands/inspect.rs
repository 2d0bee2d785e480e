//! Inspect command implementation.

use super::load_snapshot;
use causeway_sync_engine::{QueueCounts, QueueSnapshot};
use serde::Serialize;
use std::path::Path;

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal file size in bytes.
    pub journal_size: u64,
    /// Pull cursor.
    pub cursor: u64,
    /// Items by status.
    pub counts: QueueCounts,
    /// Total queued items.
    pub total: usize,
    /// Parked conflicts (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parked: Option<Vec<ParkedInfo>>,
}

/// A parked conflict.
#[derive(Debug, Serialize)]
pub struct ParkedInfo {
    /// Conflict id.
    pub conflict_id: String,
    /// Queue item holding the remote operation.
    pub seq: u64,
    /// Entity key.
    pub entity: String,
    /// Local operation id.
    pub local_op: String,
    /// Remote operation id.
    pub remote_op: String,
    /// Detection time (ms).
    pub detected_at: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_parked: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load_snapshot(path)?;
    let mut result = summarize(&snapshot, show_parked);
    result.path = path.display().to_string();
    result.journal_size = std::fs::metadata(path)?.len();

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn summarize(snapshot: &QueueSnapshot, show_parked: bool) -> InspectResult {
    let counts = snapshot.counts();
    let parked = show_parked.then(|| {
        snapshot
            .parked()
            .map(|p| ParkedInfo {
                conflict_id: p.record.conflict_id.to_string(),
                seq: p.seq,
                entity: p.record.key().to_string(),
                local_op: p.record.local_op.op_id.to_string(),
                remote_op: p.record.remote_op.op_id.to_string(),
                detected_at: p.record.detected_at,
            })
            .collect()
    });

    InspectResult {
        path: String::new(),
        journal_size: 0,
        cursor: snapshot.cursor(),
        total: counts.total(),
        counts,
        parked,
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Sync Journal: {}", result.path);
    println!("================");
    println!("Journal size:   {} bytes", result.journal_size);
    println!("Pull cursor:    {}", result.cursor);
    println!();
    println!("Queue ({} items)", result.total);
    println!("  pending:      {}", result.counts.pending);
    println!("  in progress:  {}", result.counts.in_progress);
    println!("  completed:    {}", result.counts.completed);
    println!("  failed:       {}", result.counts.failed);
    println!("  parked:       {}", result.counts.parked);

    if let Some(ref parked) = result.parked {
        println!();
        println!("Parked Conflicts");
        println!("----------------");
        if parked.is_empty() {
            println!("  (none)");
        }
        for p in parked {
            println!(
                "  {} seq={} entity={} local={} remote={}",
                p.conflict_id, p.seq, p.entity, p.local_op, p.remote_op
            );
        }
    }
}

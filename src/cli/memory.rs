//! `memory` subcommands. Each one is a single router invocation, except the
//! read-only `sessions` and `history` listings.

use anyhow::{bail, Result};
use serde_json::json;

use super::print_json;
use crate::memory::MemoryRecord;
use crate::router::{Router, ToolOutcome};

fn print_records(records: &[MemoryRecord]) {
    for r in records {
        let marker = if r.deleted { " (tombstoned)" } else { "" };
        println!("  [{}] {} {}{}", r.created_at, r.role, r.id, marker);
        for line in r.content.lines() {
            println!("      {line}");
        }
    }
}

pub async fn show(
    router: &Router,
    session_id: &str,
    limit: Option<usize>,
    include_deleted: bool,
    contains: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let outcome = router
        .invoke(
            "memory-read",
            json!({
                "session_id": session_id,
                "limit": limit,
                "include_deleted": include_deleted,
                "contains": contains,
            }),
        )
        .await?;
    let ToolOutcome::MemoryRead { records } = outcome else {
        bail!("unexpected outcome for memory-read");
    };
    if as_json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("Session {session_id} has no records.");
        return Ok(());
    }
    println!("Session {session_id}: {} record(s), most recent first\n", records.len());
    print_records(&records);
    Ok(())
}

pub async fn add(router: &Router, session_id: &str, role: &str, content: &str) -> Result<()> {
    let outcome = router
        .invoke(
            "memory-write",
            json!({"session_id": session_id, "role": role, "content": content}),
        )
        .await?;
    let ToolOutcome::MemoryWrite(record) = outcome else {
        bail!("unexpected outcome for memory-write");
    };
    println!("Stored {} in session {session_id}", record.id);
    Ok(())
}

pub async fn clear(router: &Router, session_id: &str) -> Result<()> {
    let outcome = router
        .invoke("memory-clear", json!({"session_id": session_id}))
        .await?;
    let ToolOutcome::MemoryClear { count, .. } = outcome else {
        bail!("unexpected outcome for memory-clear");
    };
    println!("Tombstoned {count} record(s) in session {session_id}.");
    if count > 0 {
        println!("Undo with `scriptorium memory restore {session_id}` until compacted.");
    }
    Ok(())
}

pub async fn restore(router: &Router, session_id: &str) -> Result<()> {
    let outcome = router
        .invoke("memory-restore", json!({"session_id": session_id}))
        .await?;
    let ToolOutcome::MemoryRestore { count, .. } = outcome else {
        bail!("unexpected outcome for memory-restore");
    };
    println!("Restored {count} record(s) in session {session_id}.");
    Ok(())
}

pub async fn forget(
    router: &Router,
    session_id: &str,
    id: Option<&str>,
    keyword: Option<&str>,
) -> Result<()> {
    let outcome = router
        .invoke(
            "memory-forget",
            json!({"session_id": session_id, "id": id, "keyword": keyword}),
        )
        .await?;
    let ToolOutcome::MemoryForget { count, .. } = outcome else {
        bail!("unexpected outcome for memory-forget");
    };
    println!("Tombstoned {count} record(s) in session {session_id}.");
    Ok(())
}

pub async fn compact(router: &Router, session_id: Option<&str>) -> Result<()> {
    let outcome = router
        .invoke("memory-compact", json!({"session_id": session_id}))
        .await?;
    let ToolOutcome::MemoryCompact { count, .. } = outcome else {
        bail!("unexpected outcome for memory-compact");
    };
    match session_id {
        Some(id) => println!("Permanently removed {count} tombstoned record(s) from session {id}."),
        None => println!("Permanently removed {count} tombstoned record(s)."),
    }
    Ok(())
}

pub async fn sessions(router: &Router, as_json: bool) -> Result<()> {
    let sessions = router.memory().sessions().await?;
    if as_json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!("{:<24} {:>6} {:>6} {:>6}  LAST ACTIVITY", "SESSION", "LIVE", "DEAD", "FACTS");
    for s in &sessions {
        println!(
            "{:<24} {:>6} {:>6} {:>6}  {}",
            s.session_id, s.live, s.tombstoned, s.pinned_facts, s.last_activity
        );
    }
    Ok(())
}

pub async fn history(router: &Router, session_id: &str, as_json: bool) -> Result<()> {
    let entries = router.memory().history(session_id).await?;
    if as_json {
        return print_json(&entries);
    }
    for e in &entries {
        let record = e.record_id.as_deref().unwrap_or("-");
        match &e.details {
            Some(details) => println!("  [{}] {:<9} {record} {details}", e.created_at, e.operation),
            None => println!("  [{}] {:<9} {record}", e.created_at, e.operation),
        }
    }
    Ok(())
}

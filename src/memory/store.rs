//! Memory persistence: append, read, tombstone, restore, compact.
//!
//! Every mutation runs in a transaction and writes a `memory_log` row in the
//! same transaction, so the audit trail can never disagree with the records.
//! Ordering is by `seq` (insertion order), which is strictly monotonic per
//! database even when timestamps collide.

use rusqlite::{params, Connection, Row, TransactionBehavior};

use super::types::{ForgetTarget, MemoryLogEntry, MemoryRecord, ReadOptions, Role, SessionSummary};
use crate::corpus::types::now_timestamp;
use crate::error::{CoreError, Result};

const RECORD_COLUMNS: &str = "id, session_id, role, content, created_at, deleted, deleted_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let role: String = row.get(2)?;
    Ok(MemoryRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: role.parse::<Role>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        content: row.get(3)?,
        created_at: row.get(4)?,
        deleted: row.get(5)?,
        deleted_at: row.get(6)?,
    })
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    session_id: &str,
    record_id: Option<&str>,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_log (operation, session_id, record_id, details, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            operation,
            session_id,
            record_id,
            details.map(|d| d.to_string()),
            now_timestamp()
        ],
    )?;
    Ok(())
}

fn require_session(kind: &str, session_id: &str) -> Result<()> {
    if session_id.trim().is_empty() {
        return Err(CoreError::invalid(kind, "session_id must not be empty"));
    }
    Ok(())
}

/// Append a record to a session.
pub fn append(
    conn: &mut Connection,
    session_id: &str,
    role: Role,
    content: &str,
) -> Result<MemoryRecord> {
    require_session("memory-write", session_id)?;
    if content.trim().is_empty() {
        return Err(CoreError::invalid("memory-write", "content must not be empty"));
    }

    let record = MemoryRecord {
        id: uuid::Uuid::now_v7().to_string(),
        session_id: session_id.to_string(),
        role,
        content: content.to_string(),
        created_at: now_timestamp(),
        deleted: false,
        deleted_at: None,
    };

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "INSERT INTO memory_records (id, session_id, role, content, created_at, deleted) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        params![
            record.id,
            record.session_id,
            record.role.as_str(),
            record.content,
            record.created_at
        ],
    )?;
    write_audit_log(
        &tx,
        "create",
        session_id,
        Some(&record.id),
        Some(&serde_json::json!({"role": role.as_str()})),
    )?;
    tx.commit()?;

    tracing::debug!(session = %session_id, id = %record.id, role = %role, "memory appended");
    Ok(record)
}

/// Most recent records first. Tombstoned records are excluded unless asked for.
pub fn read(conn: &Connection, session_id: &str, options: &ReadOptions) -> Result<Vec<MemoryRecord>> {
    if options.limit == 0 {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM memory_records \
         WHERE session_id = ?1 \
           AND (?2 OR deleted = 0) \
           AND (?3 IS NULL OR instr(lower(content), lower(?3)) > 0) \
         ORDER BY seq DESC LIMIT ?4"
    ))?;
    let records = stmt
        .query_map(
            params![
                session_id,
                options.include_deleted,
                options.contains.as_deref(),
                options.limit as i64
            ],
            record_from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Live pinned facts of a session in the order they were pinned.
pub fn pinned_facts(conn: &Connection, session_id: &str) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM memory_records \
         WHERE session_id = ?1 AND role = 'pinned-fact' AND deleted = 0 ORDER BY seq"
    ))?;
    let records = stmt
        .query_map(params![session_id], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Most recent live conversation turns (no pinned facts), newest first.
pub fn recent_turns(conn: &Connection, session_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {RECORD_COLUMNS} FROM memory_records \
         WHERE session_id = ?1 AND role != 'pinned-fact' AND deleted = 0 \
         ORDER BY seq DESC LIMIT ?2"
    ))?;
    let records = stmt
        .query_map(params![session_id, limit as i64], record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Tombstone every live record of a session. Unknown sessions yield 0.
pub fn clear(conn: &mut Connection, session_id: &str) -> Result<usize> {
    require_session("memory-clear", session_id)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let count = tx.execute(
        "UPDATE memory_records SET deleted = 1, deleted_at = ?1 WHERE session_id = ?2 AND deleted = 0",
        params![now_timestamp(), session_id],
    )?;
    if count > 0 {
        write_audit_log(
            &tx,
            "tombstone",
            session_id,
            None,
            Some(&serde_json::json!({"reason": "clear", "count": count})),
        )?;
    }
    tx.commit()?;
    tracing::info!(session = %session_id, count, "session cleared");
    Ok(count)
}

/// Reverse tombstones that have not been compacted yet.
pub fn restore(conn: &mut Connection, session_id: &str) -> Result<usize> {
    require_session("memory-restore", session_id)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let count = tx.execute(
        "UPDATE memory_records SET deleted = 0, deleted_at = NULL WHERE session_id = ?1 AND deleted = 1",
        params![session_id],
    )?;
    if count > 0 {
        write_audit_log(
            &tx,
            "restore",
            session_id,
            None,
            Some(&serde_json::json!({"count": count})),
        )?;
    }
    tx.commit()?;
    tracing::info!(session = %session_id, count, "session restored");
    Ok(count)
}

/// Tombstone one record, or every live record mentioning a keyword.
pub fn forget(conn: &mut Connection, session_id: &str, target: &ForgetTarget) -> Result<usize> {
    require_session("memory-forget", session_id)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now = now_timestamp();
    let (count, record_id, details) = match target {
        ForgetTarget::Id(id) => {
            let count = tx.execute(
                "UPDATE memory_records SET deleted = 1, deleted_at = ?1 \
                 WHERE session_id = ?2 AND id = ?3 AND deleted = 0",
                params![now, session_id, id],
            )?;
            (count, Some(id.as_str()), serde_json::json!({"reason": "forget-id"}))
        }
        ForgetTarget::Keyword(keyword) => {
            if keyword.trim().is_empty() {
                return Err(CoreError::invalid("memory-forget", "keyword must not be empty"));
            }
            let count = tx.execute(
                "UPDATE memory_records SET deleted = 1, deleted_at = ?1 \
                 WHERE session_id = ?2 AND deleted = 0 AND instr(lower(content), lower(?3)) > 0",
                params![now, session_id, keyword],
            )?;
            (
                count,
                None,
                serde_json::json!({"reason": "forget-keyword", "keyword": keyword, "count": count}),
            )
        }
    };
    if count > 0 {
        write_audit_log(&tx, "tombstone", session_id, record_id, Some(&details))?;
    }
    tx.commit()?;
    Ok(count)
}

/// Physically delete tombstoned records, for one session or all of them.
pub fn compact(conn: &mut Connection, session_id: Option<&str>) -> Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let per_session: Vec<(String, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT session_id, COUNT(*) FROM memory_records \
             WHERE deleted = 1 AND (?1 IS NULL OR session_id = ?1) GROUP BY session_id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let removed = tx.execute(
        "DELETE FROM memory_records WHERE deleted = 1 AND (?1 IS NULL OR session_id = ?1)",
        params![session_id],
    )?;
    for (session, count) in &per_session {
        write_audit_log(
            &tx,
            "compact",
            session,
            None,
            Some(&serde_json::json!({"removed": count})),
        )?;
    }
    tx.commit()?;
    tracing::info!(session = ?session_id, removed, "tombstones compacted");
    Ok(removed)
}

/// Every session with at least one stored record, most recently active first.
pub fn sessions(conn: &Connection) -> Result<Vec<SessionSummary>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, \
                SUM(deleted = 0), SUM(deleted = 1), \
                SUM(deleted = 0 AND role = 'pinned-fact'), MAX(created_at) \
         FROM memory_records GROUP BY session_id ORDER BY MAX(seq) DESC",
    )?;
    let summaries = stmt
        .query_map([], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                live: row.get::<_, i64>(1)? as u64,
                tombstoned: row.get::<_, i64>(2)? as u64,
                pinned_facts: row.get::<_, i64>(3)? as u64,
                last_activity: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(summaries)
}

/// Audit trail of a session, oldest first.
pub fn history(conn: &Connection, session_id: &str) -> Result<Vec<MemoryLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT operation, session_id, record_id, details, created_at \
         FROM memory_log WHERE session_id = ?1 ORDER BY id",
    )?;
    let entries = stmt
        .query_map(params![session_id], |row| {
            let details: Option<String> = row.get(3)?;
            Ok(MemoryLogEntry {
                operation: row.get(0)?,
                session_id: row.get(1)?,
                record_id: row.get(2)?,
                details: details.and_then(|d| serde_json::from_str(&d).ok()),
                created_at: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_store;

    fn seed(conn: &mut Connection, session: &str) -> Vec<MemoryRecord> {
        vec![
            append(conn, session, Role::User, "what is kerberoasting?").unwrap(),
            append(conn, session, Role::Assistant, "Kerberoasting abuses service tickets.").unwrap(),
            append(conn, session, Role::PinnedFact, "The lab domain is corp.local").unwrap(),
        ]
    }

    #[test]
    fn read_is_most_recent_first() {
        let mut conn = open_memory_store();
        let records = seed(&mut conn, "s1");
        let read_back = read(&conn, "s1", &ReadOptions::recent(10)).unwrap();
        let ids: Vec<&str> = read_back.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![&records[2].id, &records[1].id, &records[0].id]);

        let limited = read(&conn, "s1", &ReadOptions::recent(1)).unwrap();
        assert_eq!(limited[0].role, Role::PinnedFact);
        assert!(read(&conn, "other", &ReadOptions::recent(10)).unwrap().is_empty());
    }

    #[test]
    fn append_rejects_blank_content() {
        let mut conn = open_memory_store();
        let err = append(&mut conn, "s1", Role::User, "   ").unwrap_err();
        assert!(matches!(err, CoreError::InvalidInvocation { .. }));
        let err = append(&mut conn, "", Role::User, "hi").unwrap_err();
        assert!(matches!(err, CoreError::InvalidInvocation { .. }));
    }

    #[test]
    fn contains_filter_is_case_insensitive() {
        let mut conn = open_memory_store();
        seed(&mut conn, "s1");
        let opts = ReadOptions {
            limit: 10,
            contains: Some("KERBEROASTING".into()),
            ..ReadOptions::default()
        };
        assert_eq!(read(&conn, "s1", &opts).unwrap().len(), 2);
    }

    #[test]
    fn clear_then_restore() {
        let mut conn = open_memory_store();
        seed(&mut conn, "s1");
        seed(&mut conn, "s2");

        assert_eq!(clear(&mut conn, "s1").unwrap(), 3);
        assert!(read(&conn, "s1", &ReadOptions::recent(10)).unwrap().is_empty());
        assert_eq!(read(&conn, "s2", &ReadOptions::recent(10)).unwrap().len(), 3);

        let audit = ReadOptions {
            limit: 10,
            include_deleted: true,
            ..ReadOptions::default()
        };
        let tombstoned = read(&conn, "s1", &audit).unwrap();
        assert!(tombstoned.iter().all(|r| r.deleted && r.deleted_at.is_some()));

        assert_eq!(clear(&mut conn, "missing").unwrap(), 0);
        assert_eq!(restore(&mut conn, "s1").unwrap(), 3);
        assert_eq!(read(&conn, "s1", &ReadOptions::recent(10)).unwrap().len(), 3);
    }

    #[test]
    fn forget_by_id_and_keyword() {
        let mut conn = open_memory_store();
        let records = seed(&mut conn, "s1");
        assert_eq!(forget(&mut conn, "s1", &ForgetTarget::Id(records[0].id.clone())).unwrap(), 1);
        assert_eq!(forget(&mut conn, "s1", &ForgetTarget::Id(records[0].id.clone())).unwrap(), 0);
        assert_eq!(
            forget(&mut conn, "s1", &ForgetTarget::Keyword("corp.LOCAL".into())).unwrap(),
            1
        );
        let live = read(&conn, "s1", &ReadOptions::recent(10)).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].role, Role::Assistant);
        assert!(pinned_facts(&conn, "s1").unwrap().is_empty());
    }

    #[test]
    fn compact_removes_only_tombstones() {
        let mut conn = open_memory_store();
        let records = seed(&mut conn, "s1");
        seed(&mut conn, "s2");
        forget(&mut conn, "s1", &ForgetTarget::Id(records[1].id.clone())).unwrap();
        clear(&mut conn, "s2").unwrap();

        assert_eq!(compact(&mut conn, Some("s1")).unwrap(), 1);
        let all_s1 = ReadOptions {
            limit: 10,
            include_deleted: true,
            ..ReadOptions::default()
        };
        assert_eq!(read(&conn, "s1", &all_s1).unwrap().len(), 2);
        // s2 tombstones untouched until compacted explicitly
        assert_eq!(restore(&mut conn, "s2").unwrap(), 3);

        clear(&mut conn, "s2").unwrap();
        assert_eq!(compact(&mut conn, None).unwrap(), 3);
        assert_eq!(restore(&mut conn, "s2").unwrap(), 0);
    }

    #[test]
    fn every_mutation_is_logged() {
        let mut conn = open_memory_store();
        seed(&mut conn, "s1");
        clear(&mut conn, "s1").unwrap();
        restore(&mut conn, "s1").unwrap();
        clear(&mut conn, "s1").unwrap();
        compact(&mut conn, Some("s1")).unwrap();

        let ops: Vec<String> = history(&conn, "s1")
            .unwrap()
            .into_iter()
            .map(|e| e.operation)
            .collect();
        assert_eq!(
            ops,
            vec!["create", "create", "create", "tombstone", "restore", "tombstone", "compact"]
        );
    }

    #[test]
    fn sessions_summarize_counts() {
        let mut conn = open_memory_store();
        seed(&mut conn, "s1");
        seed(&mut conn, "s2");
        clear(&mut conn, "s1").unwrap();
        let summaries = sessions(&conn).unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].session_id, "s2");
        assert_eq!(summaries[0].live, 3);
        assert_eq!(summaries[0].pinned_facts, 1);
        assert_eq!(summaries[1].session_id, "s1");
        assert_eq!(summaries[1].tombstoned, 3);
        assert_eq!(summaries[1].pinned_facts, 0);
    }
}

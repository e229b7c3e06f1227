//! CLI `doctor` command: database diagnostics, index consistency, and an
//! optional index rebuild.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;

use crate::db;
use crate::router::{Router, ToolOutcome};

fn report_database(label: &str, path: &Path) -> Result<bool> {
    let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let conn = db::open_connection(path)
        .with_context(|| format!("failed to open {label} database (may be corrupt)"))?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("{label} database:");
    println!("  Path:            {}", path.display());
    println!("  File size:       {}", format_bytes(file_size));
    println!("  Schema version:  {}", report.schema_version);
    if report.integrity_ok {
        println!("  Integrity:       PASSED");
    } else {
        println!("  Integrity:       FAILED ({})", report.integrity_details);
    }
    println!();
    Ok(report.integrity_ok)
}

/// Run diagnostics and print a health report. With `repair`, rebuild the
/// lexical and vector indexes from the stored chunks.
pub async fn doctor(router: &Router, repair: bool) -> Result<()> {
    let config = router.config();

    println!("Scriptorium Health Report");
    println!("=========================");
    println!();

    let corpus_ok = report_database("Corpus", &config.corpus_db_path())?;
    let memory_ok = report_database("Memory", &config.memory_db_path())?;

    let conn = db::open_connection(config.corpus_db_path())?;
    let health = db::check_database_health(&conn)?;
    drop(conn);
    let configured = router.embedding_model();
    println!("sqlite-vec:          {}", health.sqlite_vec_version);
    println!("Embedding model:");
    println!(
        "  Stored:            {}",
        health.embedding_model.as_deref().unwrap_or("(not set)")
    );
    println!(
        "  Configured:        {}",
        configured.as_deref().unwrap_or("(none, lexical only)")
    );
    if let (Some(stored), Some(configured)) = (&health.embedding_model, &configured) {
        if stored != configured {
            println!("  WARNING: model mismatch! Run `scriptorium doctor --repair` to re-embed.");
        }
    }
    println!();

    let outcome = router
        .invoke("index-check", json!({"repair": repair}))
        .await?;
    let ToolOutcome::IndexCheck(index) = outcome else {
        bail!("unexpected outcome for index-check");
    };
    println!("Index:");
    println!("  Chunks:            {}", index.chunks);
    println!("  Lexical entries:   {}", index.lexical_entries);
    if index.vectors_enabled {
        println!("  Vector entries:    {}", index.vector_entries);
    }
    println!("  Orphan chunks:     {}", index.orphan_chunks);
    println!(
        "  Dangling entries:  {} lexical, {} vector",
        index.dangling_lexical, index.dangling_vector
    );
    println!(
        "  Missing entries:   {} lexical, {} vector",
        index.missing_lexical, index.missing_vector
    );
    if index.repaired {
        println!("  Status:            REBUILT");
    } else if index.is_healthy() {
        println!("  Status:            OK");
    } else {
        println!("  Status:            INCONSISTENT (run `scriptorium doctor --repair`)");
    }

    if !(corpus_ok && memory_ok) {
        println!();
        println!("Recovery steps:");
        println!("  1. Restore the damaged file from a backup.");
        println!("  2. Or delete corpus.db and re-run `scriptorium ingest`; memory.db is independent.");
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

//! Corpus commands: `ingest`, `query`, `purge`, `stats`.

use anyhow::{bail, Result};
use serde_json::json;

use super::{preview, print_json};
use crate::router::{Router, ToolOutcome};

pub async fn ingest(router: &Router, path: &str, source: Option<&str>, as_json: bool) -> Result<()> {
    let outcome = router
        .invoke("ingest", json!({"path": path, "source": source}))
        .await?;
    let ToolOutcome::Ingest(outcome) = outcome else {
        bail!("unexpected outcome for ingest");
    };
    if as_json {
        return print_json(&outcome);
    }

    let batch = &outcome.batch;
    let added: usize = batch.reports.iter().map(|r| r.chunks_added).sum();
    let carried: usize = batch.reports.iter().map(|r| r.chunks_updated).sum();
    let removed: usize = batch.reports.iter().map(|r| r.chunks_removed).sum();
    let unchanged = batch.reports.iter().filter(|r| r.unchanged).count();

    println!("Ingested {} document(s) from {path}", batch.reports.len());
    println!("  Unchanged:         {unchanged}");
    println!("  Chunks added:      {added}");
    println!("  Chunks carried:    {carried}");
    println!("  Chunks removed:    {removed}");
    if !outcome.skipped.is_empty() {
        println!();
        println!("Skipped {} record(s):", outcome.skipped.len());
        for reason in &outcome.skipped {
            println!("  - {reason}");
        }
    }
    if !batch.errors.is_empty() {
        println!();
        println!("Rejected {} document(s):", batch.errors.len());
        for err in &batch.errors {
            println!("  - {}: {}", err.document_id, err.cause);
        }
    }
    Ok(())
}

pub async fn query(
    router: &Router,
    text: &str,
    top_k: Option<usize>,
    source: Option<&str>,
    as_json: bool,
) -> Result<()> {
    let outcome = router
        .invoke("retrieve", json!({"query": text, "top_k": top_k, "source": source}))
        .await?;
    let ToolOutcome::Retrieve { passages } = outcome else {
        bail!("unexpected outcome for retrieve");
    };
    if as_json {
        return print_json(&passages);
    }

    if passages.is_empty() {
        println!("No results found.");
        return Ok(());
    }
    println!("Found {} passage(s)\n", passages.len());
    for (i, p) in passages.iter().enumerate() {
        println!(
            "  {}. [{}] {} (score: {:.4}, retrieved {})",
            i + 1,
            p.provenance.source,
            p.provenance.title,
            p.score,
            p.provenance.retrieved_at
        );
        println!(
            "     doc {} chars {}..{}",
            &p.provenance.document_id[..12.min(p.provenance.document_id.len())],
            p.provenance.offset_range.start,
            p.provenance.offset_range.end
        );
        println!("     {}", preview(&p.text, 160));
        println!();
    }
    Ok(())
}

pub async fn purge(router: &Router, document_id: &str) -> Result<()> {
    let outcome = router
        .invoke("corpus-purge", json!({"document_id": document_id}))
        .await?;
    match outcome {
        ToolOutcome::CorpusPurge { purged: true, .. } => println!("Purged {document_id}"),
        ToolOutcome::CorpusPurge { purged: false, .. } => {
            println!("No document with id {document_id}")
        }
        _ => bail!("unexpected outcome for corpus-purge"),
    }
    Ok(())
}

pub async fn stats(router: &Router, as_json: bool) -> Result<()> {
    let ToolOutcome::CorpusStats(stats) = router.invoke("corpus-stats", json!({})).await? else {
        bail!("unexpected outcome for corpus-stats");
    };
    if as_json {
        return print_json(&stats);
    }

    println!("Corpus Statistics");
    println!("{}", "=".repeat(40));
    println!("  Documents:           {}", stats.documents);
    println!("  Live:                {}", stats.live_documents);
    println!("  Superseded:          {}", stats.superseded_documents);
    println!("  Chunks:              {}", stats.chunks);
    println!();
    println!("By Source:");
    for (source, count) in &stats.by_source {
        println!("  {:<14} {}", source, count);
    }
    println!();
    println!(
        "Embedding model:       {}",
        stats.embedding_model.as_deref().unwrap_or("(lexical only)")
    );
    Ok(())
}

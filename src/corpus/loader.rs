//! Reads raw documents from files for the `ingest` command.
//!
//! Supported inputs: `.jsonl` (one record per line), `.json` (a record, an
//! array of records, or a STIX 2.x bundle), `.txt` / `.md` (whole file is one
//! document titled by the file stem). Directories are walked recursively in
//! sorted order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use super::types::{RawDocument, Source};

const TEXT_EXTENSIONS: &[&str] = &["txt", "md"];

/// Documents read from a path plus the records that had to be skipped.
#[derive(Debug, Default)]
pub struct LoadedDocuments {
    pub documents: Vec<RawDocument>,
    pub skipped: Vec<String>,
}

impl LoadedDocuments {
    fn extend(&mut self, other: LoadedDocuments) {
        self.documents.extend(other.documents);
        self.skipped.extend(other.skipped);
    }
}

/// Load every supported file under `path`. `source` overrides whatever source
/// the records declare; STIX attack patterns are always `mitre_attack`.
pub fn load_path(path: &Path, source: Option<Source>) -> Result<LoadedDocuments> {
    let mut loaded = LoadedDocuments::default();
    if path.is_dir() {
        // one unreadable file must not sink the rest of the directory
        for file in walk(path)? {
            match load_file(&file, source) {
                Ok(docs) => loaded.extend(docs),
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %format!("{e:#}"), "file skipped");
                    loaded.skipped.push(format!("{}: {e:#}", file.display()));
                }
            }
        }
    } else {
        loaded = load_file(path, source)?;
    }
    tracing::info!(
        path = %path.display(),
        documents = loaded.documents.len(),
        skipped = loaded.skipped.len(),
        "documents loaded"
    );
    Ok(loaded)
}

fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            files.extend(walk(&entry)?);
        } else if is_supported(&entry) {
            files.push(entry);
        }
    }
    Ok(files)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

fn is_supported(path: &Path) -> bool {
    let ext = extension(path);
    ext == "json" || ext == "jsonl" || TEXT_EXTENSIONS.contains(&ext.as_str())
}

fn load_file(path: &Path, source: Option<Source>) -> Result<LoadedDocuments> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let ext = extension(path);
    let mut loaded = LoadedDocuments::default();

    match ext.as_str() {
        "jsonl" => {
            for (n, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let label = format!("{}:{}", path.display(), n + 1);
                match serde_json::from_str::<Value>(line) {
                    Ok(value) => push_record(&mut loaded, &value, source, &label),
                    Err(e) => loaded.skipped.push(format!("{label}: {e}")),
                }
            }
        }
        "json" => {
            let value: Value = serde_json::from_str(&contents)
                .with_context(|| format!("invalid JSON in {}", path.display()))?;
            let label = path.display().to_string();
            if is_stix_bundle(&value) {
                loaded.extend(from_stix_bundle(&value, &label));
            } else if let Value::Array(items) = &value {
                for (i, item) in items.iter().enumerate() {
                    push_record(&mut loaded, item, source, &format!("{label}[{i}]"));
                }
            } else {
                push_record(&mut loaded, &value, source, &label);
            }
        }
        _ if TEXT_EXTENSIONS.contains(&ext.as_str()) => {
            let title = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("untitled")
                .to_string();
            loaded.documents.push(RawDocument::new(
                source.unwrap_or(Source::Other),
                title,
                contents,
            ));
        }
        other => anyhow::bail!("unsupported file type {other:?}: {}", path.display()),
    }

    Ok(loaded)
}

fn string_field<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

fn push_record(loaded: &mut LoadedDocuments, value: &Value, source: Option<Source>, label: &str) {
    match record_to_document(value, source) {
        Ok(doc) => loaded.documents.push(doc),
        Err(reason) => {
            tracing::warn!(record = %label, %reason, "record skipped");
            loaded.skipped.push(format!("{label}: {reason}"));
        }
    }
}

/// Map a loosely shaped JSON record onto a [`RawDocument`].
pub fn record_to_document(
    value: &Value,
    source: Option<Source>,
) -> std::result::Result<RawDocument, String> {
    if !value.is_object() {
        return Err("record is not a JSON object".into());
    }
    let title = string_field(value, &["title", "name", "id"]).ok_or("record has no title")?;
    let text = string_field(value, &["raw_text", "text", "description", "content", "abstract"])
        .ok_or("record has no text")?;
    let source = match source {
        Some(s) => s,
        None => match string_field(value, &["source"]) {
            Some(s) => s.parse::<Source>()?,
            None => Source::Other,
        },
    };
    Ok(RawDocument {
        source,
        title: title.to_string(),
        raw_text: text.to_string(),
        retrieved_at: string_field(value, &["retrieved_at"]).map(str::to_string),
    })
}

fn is_stix_bundle(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("bundle")
        && value.get("objects").map(Value::is_array).unwrap_or(false)
}

fn attack_id(object: &Value) -> Option<&str> {
    object
        .get("external_references")?
        .as_array()?
        .iter()
        .find(|r| r.get("source_name").and_then(Value::as_str) == Some("mitre-attack"))?
        .get("external_id")?
        .as_str()
}

/// Each live `attack-pattern` becomes a document titled `"<technique id> <name>"`.
fn from_stix_bundle(bundle: &Value, label: &str) -> LoadedDocuments {
    let mut loaded = LoadedDocuments::default();
    let objects = bundle
        .get("objects")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    for object in objects {
        if object.get("type").and_then(Value::as_str) != Some("attack-pattern") {
            continue;
        }
        let flagged = |key: &str| object.get(key).and_then(Value::as_bool).unwrap_or(false);
        if flagged("revoked") || flagged("x_mitre_deprecated") {
            continue;
        }
        let stix_id = object.get("id").and_then(Value::as_str).unwrap_or("?");
        let (Some(name), Some(description)) = (
            string_field(object, &["name"]),
            string_field(object, &["description"]),
        ) else {
            loaded
                .skipped
                .push(format!("{label} {stix_id}: attack-pattern without name or description"));
            continue;
        };
        let title = match attack_id(object) {
            Some(tid) => format!("{tid} {name}"),
            None => name.to_string(),
        };
        let retrieved_at = string_field(object, &["modified", "created"])
            .filter(|ts| chrono::DateTime::parse_from_rfc3339(ts).is_ok())
            .map(str::to_string);

        loaded.documents.push(RawDocument {
            source: Source::MitreAttack,
            title,
            raw_text: description.to_string(),
            retrieved_at,
        });
    }
    loaded
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use stepwise_core::config::SnapshotFormat;
use stepwise_core::{Error, Result};
use tracing::debug;

/// One semantic snapshot captured before a step ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    pub step: String,
    pub action: String,
    pub snapshot: serde_json::Value,
}

impl SnapshotEntry {
    pub fn new(step: &str, action: &str, page_url: Option<String>, snapshot: serde_json::Value) -> Self {
        Self {
            recorded_at: Utc::now(),
            page_url,
            step: step.to_string(),
            action: action.to_string(),
            snapshot,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    run_id: String,
    created_at: String,
    updated_at: String,
    entries: Vec<SnapshotEntry>,
}

/// Offline dump of page snapshots, one file per run.
///
/// `Json` rewrites a single pretty-printed document per run; `Jsonl`
/// appends one entry per line.
pub struct SnapshotStore {
    dir: PathBuf,
    format: SnapshotFormat,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(dir: PathBuf, format: SnapshotFormat) -> Self {
        Self {
            dir,
            format,
            write_lock: Mutex::new(()),
        }
    }

    pub fn format(&self) -> SnapshotFormat {
        self.format
    }

    pub fn run_file(&self, run_id: &str) -> PathBuf {
        let safe_id = run_id.replace([':', '/', '\\'], "_");
        let ext = match self.format {
            SnapshotFormat::Json => "json",
            SnapshotFormat::Jsonl => "jsonl",
        };
        self.dir.join(format!("{}.{}", safe_id, ext))
    }

    pub fn append(&self, run_id: &str, entry: &SnapshotEntry) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Storage("snapshot store lock poisoned".to_string()))?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.run_file(run_id);

        match self.format {
            SnapshotFormat::Json => self.append_document(run_id, &path, entry),
            SnapshotFormat::Jsonl => {
                let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
                writeln!(file, "{}", serde_json::to_string(entry)?)?;
                Ok(())
            }
        }
    }

    fn append_document(&self, run_id: &str, path: &Path, entry: &SnapshotEntry) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut doc = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str::<SnapshotDocument>(&content)?
        } else {
            SnapshotDocument {
                run_id: run_id.to_string(),
                created_at: now.clone(),
                updated_at: now.clone(),
                entries: Vec::new(),
            }
        };
        doc.entries.push(entry.clone());
        doc.updated_at = now;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&doc)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(&self, run_id: &str) -> Result<Vec<SnapshotEntry>> {
        let path = self.run_file(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        match self.format {
            SnapshotFormat::Json => {
                let content = std::fs::read_to_string(&path)?;
                let doc: SnapshotDocument = serde_json::from_str(&content)?;
                Ok(doc.entries)
            }
            SnapshotFormat::Jsonl => {
                let reader = BufReader::new(File::open(&path)?);
                let mut entries = Vec::new();
                for line in reader.lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<SnapshotEntry>(&line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => debug!(error = %e, "Failed to parse snapshot line, skipping"),
                    }
                }
                Ok(entries)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(step: &str) -> SnapshotEntry {
        SnapshotEntry::new(
            step,
            "click",
            Some("https://example.test/".to_string()),
            json!({"role": "WebArea", "name": "Example"}),
        )
    }

    #[test]
    fn test_json_mode_writes_one_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf(), SnapshotFormat::Json);
        store.append("run-1", &entry("When I click Login")).unwrap();
        store.append("run-1", &entry("Then I see Welcome")).unwrap();

        let raw = std::fs::read_to_string(store.run_file("run-1")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["run_id"], "run-1");
        assert_eq!(doc["entries"].as_array().unwrap().len(), 2);
        assert!(raw.contains('\n'));

        let loaded = store.load("run-1").unwrap();
        assert_eq!(loaded[1].step, "Then I see Welcome");
    }

    #[test]
    fn test_jsonl_mode_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf(), SnapshotFormat::Jsonl);
        store.append("run-2", &entry("a")).unwrap();
        store.append("run-2", &entry("b")).unwrap();

        let raw = std::fs::read_to_string(store.run_file("run-2")).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert_eq!(store.load("run-2").unwrap().len(), 2);
    }

    #[test]
    fn test_runs_are_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().to_path_buf(), SnapshotFormat::Json);
        store.append("a", &entry("x")).unwrap();
        store.append("b", &entry("y")).unwrap();
        assert_eq!(store.load("a").unwrap().len(), 1);
        assert_eq!(store.load("b").unwrap().len(), 1);
        assert!(store.load("missing").unwrap().is_empty());
    }

    #[test]
    fn test_run_file_sanitizes_id() {
        let store = SnapshotStore::new(PathBuf::from("/tmp/snaps"), SnapshotFormat::Jsonl);
        assert_eq!(store.run_file("a/b:c"), PathBuf::from("/tmp/snaps/a_b_c.jsonl"));
    }
}

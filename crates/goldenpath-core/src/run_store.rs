use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::types::RunRecord;

/// Append-only durable store of completed run records, one JSON object per
/// line.
pub struct RunStore {
    path: PathBuf,
}

impl RunStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save(&self, record: &RunRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let line = serde_json::to_string(record).context("serialize run record")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        writeln!(file, "{line}").context("append run record")?;
        Ok(())
    }

    /// Load all records in append order. Lines that fail to parse are skipped.
    pub fn load(&self) -> Result<Vec<RunRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunStatus, StepStatus};

    #[test]
    fn records_append_and_reload_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runs.jsonl"));

        for n in 1..=3u32 {
            let mut rec = RunRecord {
                id: format!("r{n}"),
                num: n,
                status: RunStatus::Success,
                ..Default::default()
            };
            rec.steps.insert("merge".into(), StepStatus::Success);
            store.save(&rec).unwrap();
        }

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0].id, "r1");
        assert_eq!(loaded[2].id, "r3");
        assert_eq!(loaded[1].steps["merge"], StepStatus::Success);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        std::fs::write(
            &path,
            "{\"id\":\"r1\",\"num\":1,\"status\":\"success\"}\nnot json\n",
        )
        .unwrap();
        let store = RunStore::new(path);
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "r1");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runs.jsonl"));
        assert!(store.load().unwrap().is_empty());
    }
}

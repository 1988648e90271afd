use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;

use panemux_types::{PaneId, PaneSize, Result};

/// Appends a JSONL transcript of pane I/O under the configured directory.
///
/// One file per pane, one entry per event: `in`, `out`, and `resize`.
/// Written synchronously from the PTY reader/writer threads, never from
/// the async runtime. Output bytes are stored lossily decoded; the raw
/// stream stays on the output channel.
pub struct TranscriptLogger {
    pane_id: PaneId,
    file: File,
    path: PathBuf,
}

impl TranscriptLogger {
    pub fn create(dir: &Path, pane_id: PaneId) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("pane-{pane_id}.jsonl"));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            pane_id,
            file,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_input(&mut self, data: &[u8]) -> Result<()> {
        self.log_entry("in", json!(String::from_utf8_lossy(data)))
    }

    pub fn log_output(&mut self, data: &[u8]) -> Result<()> {
        self.log_entry("out", json!(String::from_utf8_lossy(data)))
    }

    pub fn log_resize(&mut self, size: PaneSize) -> Result<()> {
        self.log_entry("resize", json!({ "rows": size.rows, "cols": size.cols }))
    }

    fn log_entry(&mut self, direction: &str, data: serde_json::Value) -> Result<()> {
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "pane_id": self.pane_id.to_string(),
            "direction": direction,
            "data": data,
        });
        writeln!(self.file, "{entry}")?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_appended_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let pane_id = PaneId::new();
        let mut logger = TranscriptLogger::create(dir.path(), pane_id).unwrap();

        logger.log_input(b"ls\n").unwrap();
        logger.log_output(b"Cargo.toml\n").unwrap();
        logger.log_resize(PaneSize::new(40, 120)).unwrap();

        let text = std::fs::read_to_string(logger.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["direction"], "in");
        assert_eq!(first["pane_id"], pane_id.to_string());

        let resize: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(resize["data"]["cols"], 120);
    }
}

use bytes::Bytes;
use chrono::Utc;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use termbridge_types::{CloseReason, Dimensions};

/// Session transcript: one JSON object per line for every input, output,
/// resize and close event, plus a metadata sidecar file
pub struct TranscriptLogger {
    session_id: String,
    log_file: File,
    meta_file: File,
}

impl TranscriptLogger {
    /// Create a new transcript for a session
    pub fn new(session_id: &str, log_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;

        let log_path = log_dir.join(format!("session-{}.log", session_id));
        let meta_path = log_dir.join(format!("session-{}-meta.json", session_id));

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let meta_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&meta_path)?;

        Ok(Self {
            session_id: session_id.to_string(),
            log_file,
            meta_file,
        })
    }

    /// Log input to PTY
    pub fn log_input(&mut self, data: &Bytes) -> io::Result<()> {
        self.log_event("in", data)
    }

    /// Log output from PTY
    pub fn log_output(&mut self, data: &Bytes) -> io::Result<()> {
        self.log_event("out", data)
    }

    /// Log resize event
    pub fn log_resize(&mut self, dimensions: Dimensions) -> io::Result<()> {
        self.write_line(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": self.session_id,
            "event": "resize",
            "cols": dimensions.cols,
            "rows": dimensions.rows,
        }))
    }

    pub fn log_closed(&mut self, reason: &CloseReason, exit_code: Option<i32>) -> io::Result<()> {
        self.write_line(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": self.session_id,
            "event": "closed",
            "reason": reason.code(),
            "detail": reason.to_string(),
            "exit_code": exit_code,
        }))
    }

    /// Write metadata
    pub fn write_metadata(
        &mut self,
        id: &str,
        command: &str,
        working_dir: &str,
        pid: Option<u32>,
        dimensions: Dimensions,
    ) -> io::Result<()> {
        let metadata = json!({
            "session_id": id,
            "command": command,
            "working_dir": working_dir,
            "pid": pid,
            "cols": dimensions.cols,
            "rows": dimensions.rows,
            "started_at": Utc::now().to_rfc3339(),
        });
        let json_str = serde_json::to_string_pretty(&metadata)?;

        self.meta_file.set_len(0)?;
        self.meta_file.write_all(json_str.as_bytes())?;
        self.meta_file.flush()
    }

    fn log_event(&mut self, direction: &str, data: &Bytes) -> io::Result<()> {
        self.write_line(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "session_id": self.session_id,
            "direction": direction,
            "data": String::from_utf8_lossy(data),
        }))
    }

    fn write_line(&mut self, entry: serde_json::Value) -> io::Result<()> {
        writeln!(self.log_file, "{}", entry)?;
        self.log_file.flush()
    }
}

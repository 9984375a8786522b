use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Local;
use log::warn;

/// Append-only trail of committed lifecycle operations, one line each.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    /**
     * @brief Append a timestamped line, creating the file if missing.
     * @param action Short verb, e.g. `create`.
     * @param detail Free text; must never contain key material.
     */
    pub fn record(&self, action: &str, detail: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let line = format!("{} {action} {detail}", Local::now().format("%Y-%m-%d %H:%M:%S"));
        if let Err(e) = write_line(path, &line) {
            warn!("audit log {} not writable: {e}", path.display());
        }
    }
}

fn write_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

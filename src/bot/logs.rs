// =============================================================================
// Bot Log Files — per-bot append-only logs behind `get_logs`
// =============================================================================
//
// Each worker writes one line per notable event to `logs/bot_{id}.log`.
// The control plane serves the tail of this file. This is deliberately not
// the tracing pipeline: the file is a user-facing activity journal, the
// tracing output is for operators.
// =============================================================================

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};

pub struct BotLogger {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl BotLogger {
    pub fn open(dir: impl AsRef<Path>, bot_id: Uuid) -> EngineResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            EngineError::Configuration(format!("cannot create log dir {}: {e}", dir.display()))
        })?;
        let path = dir.join(format!("bot_{bot_id}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                EngineError::Configuration(format!("cannot open {}: {e}", path.display()))
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one timestamped line; write errors are swallowed (the journal
    /// must never take a cycle down).
    pub fn line(&self, message: &str) {
        let mut file = self.file.lock();
        let _ = writeln!(file, "{} {}", Utc::now().format("%Y-%m-%d %H:%M:%S"), message);
    }

    /// Last `lines` lines of a bot's log file.
    pub fn tail(dir: impl AsRef<Path>, bot_id: Uuid, lines: usize) -> Vec<String> {
        let path = dir.as_ref().join(format!("bot_{bot_id}.log"));
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                all[start..].iter().map(|s| s.to_string()).collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for BotLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotLogger").field("path", &self.path).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_lines() {
        let dir = std::env::temp_dir().join(format!("meridian-logs-{}", Uuid::new_v4()));
        let bot_id = Uuid::new_v4();
        let logger = BotLogger::open(&dir, bot_id).unwrap();
        for i in 0..10 {
            logger.line(&format!("event {i}"));
        }

        let tail = BotLogger::tail(&dir, bot_id, 3);
        assert_eq!(tail.len(), 3);
        assert!(tail[2].contains("event 9"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn tail_of_missing_file_is_empty() {
        let dir = std::env::temp_dir().join(format!("meridian-logs-{}", Uuid::new_v4()));
        assert!(BotLogger::tail(&dir, Uuid::new_v4(), 10).is_empty());
    }
}

// =============================================================================
// Status Publisher — worker-to-control-plane handoff through the filesystem
// =============================================================================
//
// Workers publish to `status/bot_{id}.json` (plus positions and debate
// sidecars) after every cycle; the control plane reads the files back. No
// shared memory crosses the worker boundary, so a crashed worker leaves
// its last published word behind and a restarted control plane still has
// answers. All writes are atomic tmp + rename.
// =============================================================================

use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::types::{BotStatus, Position};

pub struct StatusPublisher {
    dir: PathBuf,
}

impl StatusPublisher {
    pub fn new(dir: impl AsRef<Path>) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot create status dir {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    fn status_path(&self, bot_id: Uuid) -> PathBuf {
        self.dir.join(format!("bot_{bot_id}.json"))
    }

    fn positions_path(&self, bot_id: Uuid) -> PathBuf {
        self.dir.join(format!("bot_{bot_id}_positions.json"))
    }

    fn debate_path(&self, bot_id: Uuid) -> PathBuf {
        self.dir.join(format!("bot_{bot_id}_debate.json"))
    }

    fn write_atomic(path: &Path, content: &[u8]) -> EngineResult<()> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| EngineError::Transient(format!("status tmp write failed: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| EngineError::Transient(format!("status rename failed: {e}")))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Writes (worker side)
    // -------------------------------------------------------------------------

    pub fn publish(&self, status: &BotStatus) -> EngineResult<()> {
        let content = serde_json::to_vec_pretty(status)
            .map_err(|e| EngineError::Validation(format!("status serialise: {e}")))?;
        Self::write_atomic(&self.status_path(status.bot_id), &content)
    }

    pub fn publish_positions(&self, bot_id: Uuid, positions: &[Position]) -> EngineResult<()> {
        let content = serde_json::to_vec_pretty(positions)
            .map_err(|e| EngineError::Validation(format!("positions serialise: {e}")))?;
        Self::write_atomic(&self.positions_path(bot_id), &content)
    }

    pub fn publish_debate(&self, bot_id: Uuid, debate: &serde_json::Value) -> EngineResult<()> {
        let content = serde_json::to_vec_pretty(debate)
            .map_err(|e| EngineError::Validation(format!("debate serialise: {e}")))?;
        Self::write_atomic(&self.debate_path(bot_id), &content)
    }

    // -------------------------------------------------------------------------
    // Reads (control-plane side)
    // -------------------------------------------------------------------------

    pub fn read(&self, bot_id: Uuid) -> BotStatus {
        match std::fs::read(self.status_path(bot_id)) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(%bot_id, error = %e, "status file unparseable");
                BotStatus::unknown(bot_id)
            }),
            Err(_) => BotStatus::unknown(bot_id),
        }
    }

    pub fn read_positions(&self, bot_id: Uuid) -> Vec<Position> {
        std::fs::read(self.positions_path(bot_id))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn read_debate(&self, bot_id: Uuid) -> Option<serde_json::Value> {
        std::fs::read(self.debate_path(bot_id))
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("dir", &self.dir)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Balance, BotState};

    fn temp_publisher() -> (StatusPublisher, PathBuf) {
        let dir = std::env::temp_dir().join(format!("meridian-status-{}", Uuid::new_v4()));
        (StatusPublisher::new(&dir).unwrap(), dir)
    }

    #[test]
    fn publish_then_read_roundtrip() {
        let (publisher, dir) = temp_publisher();
        let bot_id = Uuid::new_v4();
        let status = BotStatus {
            bot_id,
            is_running: true,
            current_cycle: 3,
            last_cycle_at: None,
            open_positions: 1,
            symbols_trading: vec!["BTC/USDT".into()],
            balance: Balance {
                total_usd: 9_999.0,
                available_usd: 9_000.0,
            },
            last_decision: Some("1 entry".into()),
            state: BotState::Running,
            last_error: None,
        };

        publisher.publish(&status).unwrap();
        let back = publisher.read(bot_id);
        assert_eq!(back.current_cycle, 3);
        assert_eq!(back.state, BotState::Running);
        assert_eq!(back.symbols_trading, vec!["BTC/USDT"]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn unknown_bot_reads_unknown_status() {
        let (publisher, dir) = temp_publisher();
        let status = publisher.read(Uuid::new_v4());
        assert_eq!(status.state, BotState::Unknown);
        assert!(!status.is_running);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn debate_sidecar_roundtrip() {
        let (publisher, dir) = temp_publisher();
        let bot_id = Uuid::new_v4();
        assert!(publisher.read_debate(bot_id).is_none());
        publisher
            .publish_debate(bot_id, &serde_json::json!({"summary": "2 rounds"}))
            .unwrap();
        let debate = publisher.read_debate(bot_id).unwrap();
        assert_eq!(debate["summary"], "2 rounds");
        std::fs::remove_dir_all(dir).ok();
    }
}

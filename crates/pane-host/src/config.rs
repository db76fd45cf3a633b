use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for the whole runtime. All durations are milliseconds so the
/// JSON config stays flat.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Root directory for persisted session history.
    pub history_root: PathBuf,
    /// Shell to spawn; defaults to $SHELL, then /bin/sh.
    pub shell: Option<String>,
    /// Bounded in-memory scrollback per session, in bytes.
    pub scrollback_limit: usize,
    /// How long an exited session stays queryable before removal.
    pub exit_grace_ms: u64,
    /// SIGTERM -> SIGKILL escalation window for `kill`.
    pub kill_timeout_ms: u64,
    /// Per-session exit wait bound during `cleanup`.
    pub cleanup_wait_ms: u64,
    /// Periodic port scan interval.
    pub scan_interval_ms: u64,
    /// Delay between an output hint and the out-of-cycle scan.
    pub hint_settle_ms: u64,
    /// Proxy backend connect timeout. Backends frequently do not exist
    /// yet, so this is deliberately much shorter than the OS default.
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| "/".to_string());
        Self {
            history_root: PathBuf::from(home).join(".pane-host").join("history"),
            shell: None,
            scrollback_limit: 200 * 1024,
            exit_grace_ms: 30_000,
            kill_timeout_ms: 3_000,
            cleanup_wait_ms: 5_000,
            scan_interval_ms: 2_500,
            hint_settle_ms: 400,
            connect_timeout_ms: 1_500,
        }
    }
}

impl RuntimeConfig {
    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn cleanup_wait(&self) -> Duration {
        Duration::from_millis(self.cleanup_wait_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn hint_settle(&self) -> Duration {
        Duration::from_millis(self.hint_settle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.scrollback_limit > 0);
        assert!(cfg.scan_interval() > cfg.hint_settle());
        assert!(cfg.history_root.ends_with("history"));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"scanIntervalMs": 500}"#).unwrap();
        assert_eq!(cfg.scan_interval_ms, 500);
        assert_eq!(cfg.kill_timeout_ms, RuntimeConfig::default().kill_timeout_ms);
    }
}

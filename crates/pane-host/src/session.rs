//! Session table and pty lifecycle: spawn, attach, write, resize, kill,
//! history persistence, and orderly shutdown.
//!
//! Per-session state machine: spawning -> alive -> exited (grace window)
//! -> removed, with alive -> alive self-loops on write/resize/reattach.
//! Exit finalizes the history record exactly once, whichever of the
//! natural exit path or an explicit `kill` gets there first.

use std::collections::HashMap;
use std::env;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::unix::AsyncFd;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::filter::EscapeFilter;
use crate::history::{HistoryStore, HistoryWriter};
use crate::pty::{self, MasterFd};
use crate::scrollback::ScrollbackBuffer;
use crate::util::now_millis;

/// Result of `create_or_attach`.
pub struct CreateOrAttach {
    pub is_new: bool,
    pub scrollback: Vec<u8>,
    pub was_recovered: bool,
}

/// Read-only view of a session, exposed to the port detector.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub pane_id: String,
    pub workspace_id: String,
    pub pid: i32,
    pub cwd: String,
    pub is_alive: bool,
}

struct SessionEntry {
    workspace_id: String,
    cwd: String,
    pid: i32,
    master: Arc<OwnedFd>,
    cols: u16,
    rows: u16,
    is_alive: bool,
    last_active: u64,
    was_recovered: bool,
    scrollback: ScrollbackBuffer,
    filter: EscapeFilter,
    writer: Option<HistoryWriter>,
    delete_history_on_exit: bool,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
    /// Generation counter so a replaced session's stray tasks cannot
    /// touch its successor.
    epoch: u64,
}

pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    history: Arc<HistoryStore>,
    bus: EventBus,
    config: RuntimeConfig,
    epoch: AtomicU64,
}

impl SessionManager {
    pub fn new(config: RuntimeConfig, history: Arc<HistoryStore>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            history,
            bus,
            config,
            epoch: AtomicU64::new(1),
        })
    }

    /// Attach to the live session for `pane_id`, or spawn a new one.
    /// Attaching updates the size (if given) and returns the existing
    /// scrollback; spawning recovers the prior history record for the
    /// same (workspace, pane) and starts a fresh one. Only spawn errors
    /// propagate; recovery failure degrades to an empty scrollback.
    pub async fn create_or_attach(
        self: &Arc<Self>,
        pane_id: &str,
        workspace_id: &str,
        cwd: Option<&str>,
        size: Option<(u16, u16)>,
    ) -> Result<CreateOrAttach> {
        let mut sessions = self.sessions.lock().await;

        if let Some(entry) = sessions.get_mut(pane_id) {
            if entry.is_alive {
                if let Some((cols, rows)) = size {
                    pty::resize_pty(entry.master.as_raw_fd(), cols, rows);
                    entry.cols = cols;
                    entry.rows = rows;
                }
                entry.last_active = now_millis();
                debug!(pane_id, "attached to existing session");
                return Ok(CreateOrAttach {
                    is_new: false,
                    scrollback: entry.scrollback.read(),
                    was_recovered: entry.was_recovered,
                });
            }
            // Exited session still inside its grace window: replace it.
            // Its history was finalized on the exit path.
            sessions.remove(pane_id);
        }

        let home = env::var("HOME").unwrap_or_else(|_| "/".to_string());
        let cwd = cwd.map(str::to_string).unwrap_or(home);
        let (cols, rows) = size.unwrap_or((80, 24));
        let shell = self.config.shell();

        let handle = pty::spawn_shell(&shell, &cwd, cols, rows).map_err(Error::Spawn)?;
        info!(pane_id, pid = handle.pid, %cwd, "spawned session");

        let snapshot =
            self.history
                .latest_session(workspace_id, pane_id, self.config.scrollback_limit);
        let writer = match self.history.create_writer(workspace_id, pane_id, &cwd) {
            Ok(w) => Some(w),
            Err(err) => {
                warn!(pane_id, %err, "history disabled for this session");
                None
            }
        };

        let mut scrollback = ScrollbackBuffer::new(self.config.scrollback_limit);
        scrollback.write(&snapshot.scrollback);

        let (exit_tx, exit_rx) = watch::channel(false);
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        sessions.insert(
            pane_id.to_string(),
            SessionEntry {
                workspace_id: workspace_id.to_string(),
                cwd,
                pid: handle.pid,
                master: Arc::clone(&handle.master),
                cols,
                rows,
                is_alive: true,
                last_active: now_millis(),
                was_recovered: snapshot.was_recovered,
                scrollback,
                filter: EscapeFilter::new(),
                writer,
                delete_history_on_exit: false,
                exit_tx,
                exit_rx,
                epoch,
            },
        );
        drop(sessions);

        self.spawn_read_task(pane_id.to_string(), handle.master, handle.pid, epoch);

        Ok(CreateOrAttach {
            is_new: true,
            scrollback: snapshot.scrollback,
            was_recovered: snapshot.was_recovered,
        })
    }

    /// Forward input bytes to the session's process. The one operation
    /// that fails hard on a missing session, because the caller can act
    /// on it.
    pub async fn write(&self, pane_id: &str, data: &[u8]) -> Result<()> {
        let master = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(pane_id)
                .filter(|e| e.is_alive)
                .ok_or_else(|| Error::SessionNotFound(pane_id.to_string()))?;
            entry.last_active = now_millis();
            Arc::clone(&entry.master)
        };

        let raw = master.as_raw_fd();
        let mut written = 0;
        while written < data.len() {
            let n = unsafe {
                libc::write(
                    raw,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    // Master is non-blocking; the pty buffer is full.
                    tokio::task::yield_now().await;
                    continue;
                }
                return Err(err.into());
            }
            written += n as usize;
        }
        Ok(())
    }

    /// Opportunistic operation: UI code calls this without knowing
    /// session state, so a missing or dead session is a warning, never
    /// an error.
    pub async fn resize(&self, pane_id: &str, cols: u16, rows: u16) {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(pane_id) {
            Some(entry) if entry.is_alive => {
                pty::resize_pty(entry.master.as_raw_fd(), cols, rows);
                entry.cols = cols;
                entry.rows = rows;
                entry.last_active = now_millis();
            }
            _ => warn!(pane_id, "resize ignored: session missing or exited"),
        }
    }

    /// Same contract as `resize`: never fails. Default signal is SIGTERM.
    pub async fn signal(&self, pane_id: &str, signal: Option<i32>) {
        let sig = signal
            .and_then(|s| Signal::try_from(s).ok())
            .unwrap_or(Signal::SIGTERM);
        let sessions = self.sessions.lock().await;
        match sessions.get(pane_id) {
            Some(entry) if entry.is_alive => {
                if let Err(err) = pty::send_signal(entry.pid, sig) {
                    warn!(pane_id, %err, "failed to deliver signal");
                }
            }
            _ => warn!(pane_id, "signal ignored: session missing or exited"),
        }
    }

    /// Mark the session as no longer viewed. Purely an activity update;
    /// the process keeps running.
    pub async fn detach(&self, pane_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(pane_id) {
            entry.last_active = now_millis();
            debug!(pane_id, "detached");
        }
    }

    /// Request termination. Escalates SIGTERM -> SIGKILL after the kill
    /// timeout. If the process already exited, the normal exit handler
    /// will not fire again, so finalize and remove synchronously.
    pub async fn kill(&self, pane_id: &str, delete_history: bool) {
        let (pid, mut exit_rx) = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(pane_id) {
                None => {
                    warn!(pane_id, "kill ignored: unknown session");
                    return;
                }
                Some(entry) if !entry.is_alive => {
                    if let Some(writer) = entry.writer.as_mut() {
                        writer.finalize(None);
                    }
                    let workspace_id = entry.workspace_id.clone();
                    sessions.remove(pane_id);
                    if delete_history {
                        self.history.cleanup(&workspace_id, pane_id);
                    }
                    return;
                }
                Some(entry) => {
                    entry.delete_history_on_exit = delete_history;
                    (entry.pid, entry.exit_rx.clone())
                }
            }
        };

        if let Err(err) = pty::send_signal(pid, Signal::SIGTERM) {
            warn!(pane_id, pid, %err, "SIGTERM failed");
        }
        let kill_timeout = self.config.kill_timeout();
        let pane = pane_id.to_string();
        tokio::spawn(async move {
            if timeout(kill_timeout, exit_rx.changed()).await.is_err() {
                warn!(pane_id = %pane, pid, "still alive after kill timeout, sending SIGKILL");
                let _ = pty::send_signal(pid, Signal::SIGKILL);
            }
        });
    }

    /// Terminate every live session and wait (bounded per session) for
    /// its exit notification, so shutdown can never hang on one stuck
    /// child.
    pub async fn cleanup(&self) {
        let targets: Vec<(String, i32, watch::Receiver<bool>)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, e)| e.is_alive)
                .map(|(pane, e)| (pane.clone(), e.pid, e.exit_rx.clone()))
                .collect()
        };

        for (pane, pid, mut exit_rx) in targets {
            let _ = pty::send_signal(pid, Signal::SIGTERM);
            if timeout(self.config.cleanup_wait(), exit_rx.changed())
                .await
                .is_err()
            {
                warn!(pane_id = %pane, pid, "no exit within cleanup wait, sending SIGKILL");
                let _ = pty::send_signal(pid, Signal::SIGKILL);
                let _ = timeout(Duration::from_secs(1), exit_rx.changed()).await;
            }
        }
        info!("session cleanup complete");
    }

    /// Pane/workspace/pid/cwd view for the port detector. Read-only.
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .map(|(pane, e)| SessionInfo {
                pane_id: pane.clone(),
                workspace_id: e.workspace_id.clone(),
                pid: e.pid,
                cwd: e.cwd.clone(),
                is_alive: e.is_alive,
            })
            .collect()
    }

    pub async fn scrollback(&self, pane_id: &str) -> Option<Vec<u8>> {
        let sessions = self.sessions.lock().await;
        sessions.get(pane_id).map(|e| e.scrollback.read())
    }

    pub async fn last_active(&self, pane_id: &str) -> Option<u64> {
        let sessions = self.sessions.lock().await;
        sessions.get(pane_id).map(|e| e.last_active)
    }

    // ── Output path ─────────────────────────────────────────────────

    fn spawn_read_task(
        self: &Arc<Self>,
        pane_id: String,
        master: Arc<OwnedFd>,
        pid: i32,
        epoch: u64,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let raw = master.as_raw_fd();
            match AsyncFd::new(MasterFd(master)) {
                Ok(async_fd) => {
                    let mut buf = vec![0u8; 65536];
                    loop {
                        let mut guard = match async_fd.readable().await {
                            Ok(g) => g,
                            Err(_) => break,
                        };
                        // SAFETY: reading from the pty master fd
                        let result = unsafe {
                            libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                        };
                        if result <= 0 {
                            if result < 0 {
                                let err = std::io::Error::last_os_error();
                                if err.kind() == std::io::ErrorKind::WouldBlock {
                                    guard.clear_ready();
                                    continue;
                                }
                            }
                            break; // EOF or EIO -- child exited
                        }
                        manager.ingest(&pane_id, epoch, &buf[..result as usize]).await;
                        guard.clear_ready();
                    }
                }
                Err(err) => {
                    error!(pane_id = %pane_id, %err, "failed to register pty master with reactor");
                }
            }

            let (code, signal) = tokio::task::spawn_blocking(move || pty::wait_for_exit(pid))
                .await
                .unwrap_or((None, None));
            manager.handle_exit(&pane_id, epoch, code, signal).await;
        });
    }

    /// One chunk through the single consumer path, in arrival order:
    /// filter -> history -> scrollback -> event.
    async fn ingest(&self, pane_id: &str, epoch: u64, chunk: &[u8]) {
        let filtered = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(pane_id) else {
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            let filtered = entry.filter.filter(chunk);
            if !filtered.is_empty() {
                if let Some(writer) = entry.writer.as_mut() {
                    writer.write_data(&filtered);
                }
                entry.scrollback.write(&filtered);
                entry.last_active = now_millis();
            }
            filtered
        };
        if !filtered.is_empty() {
            self.bus.publish(Event::SessionData {
                pane_id: pane_id.to_string(),
                data: filtered,
            });
        }
    }

    async fn handle_exit(
        self: &Arc<Self>,
        pane_id: &str,
        epoch: u64,
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) {
        let mut delete_history_for = None;
        {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(pane_id) else {
                return;
            };
            if entry.epoch != epoch || !entry.is_alive {
                return;
            }
            entry.is_alive = false;

            // Drain any escape sequence left incomplete at stream end.
            let tail = entry.filter.flush();
            if !tail.is_empty() {
                if let Some(writer) = entry.writer.as_mut() {
                    writer.write_data(&tail);
                }
                entry.scrollback.write(&tail);
            }

            if let Some(writer) = entry.writer.as_mut() {
                writer.write_exit(exit_code, signal);
                writer.finalize(exit_code);
            }
            let _ = entry.exit_tx.send(true);
            if entry.delete_history_on_exit {
                delete_history_for = Some(entry.workspace_id.clone());
            }
        }

        if let Some(workspace_id) = delete_history_for {
            self.history.cleanup(&workspace_id, pane_id);
        }

        info!(pane_id, ?exit_code, ?signal, "session exited");
        self.bus.publish(Event::SessionExit {
            pane_id: pane_id.to_string(),
            exit_code,
            signal,
        });

        // Keep the dead entry queryable for the grace window, then drop it
        // unless something replaced it.
        let manager = Arc::clone(self);
        let pane = pane_id.to_string();
        let grace = self.config.exit_grace();
        tokio::spawn(async move {
            sleep(grace).await;
            let mut sessions = manager.sessions.lock().await;
            if let Some(entry) = sessions.get(&pane) {
                if entry.epoch == epoch && !entry.is_alive {
                    sessions.remove(&pane);
                    debug!(pane_id = %pane, "removed exited session after grace window");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tempfile::tempdir;

    fn manager() -> (Arc<SessionManager>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = RuntimeConfig {
            history_root: dir.path().to_path_buf(),
            ..RuntimeConfig::default()
        };
        let history = Arc::new(HistoryStore::new(config.history_root.clone()));
        (SessionManager::new(config, history, EventBus::new(64)), dir)
    }

    #[tokio::test]
    async fn write_to_missing_session_fails() {
        let (mgr, _dir) = manager();
        let err = mgr.write("nope", b"ls\n").await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn resize_and_signal_on_missing_session_are_noops() {
        let (mgr, _dir) = manager();
        mgr.resize("nope", 120, 40).await;
        mgr.signal("nope", None).await;
        mgr.kill("nope", false).await;
        mgr.detach("nope").await;
    }

    #[tokio::test]
    async fn snapshot_of_empty_manager_is_empty() {
        let (mgr, _dir) = manager();
        assert!(mgr.snapshot().await.is_empty());
        assert!(mgr.scrollback("nope").await.is_none());
    }
}

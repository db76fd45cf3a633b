//! Port discovery: periodic sweeps of each session's process tree plus an
//! out-of-cycle "hint" scan triggered by server-start phrases in session
//! output, so a freshly opened port surfaces in well under a second.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::events::{Event, EventBus};
use crate::procinfo::ProcessIntrospection;
use crate::session::{SessionInfo, SessionManager};
use crate::util::now_millis;

/// Well-known infra ports that are never reported, no matter who listens.
pub const DENYLISTED_PORTS: &[u16] = &[22, 80, 443, 3306, 5432, 6379, 27017];

/// An observed listening TCP port attributable to a session. Uniquely
/// keyed by (pane_id, port).
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedPort {
    pub port: u16,
    /// Address the backend actually listens on; wildcard addresses are
    /// reachable via loopback, `[::1]`-only backends are not via IPv4.
    pub address: IpAddr,
    pub pid: i32,
    pub process_name: String,
    pub service_label: String,
    pub pane_id: String,
    pub workspace_id: String,
    pub first_seen: u64,
}

#[derive(Default)]
struct DetectorCache {
    panes: HashMap<String, Vec<DetectedPort>>,
    /// Global first-seen order of (pane, port); target selection for
    /// unlabeled proxy routes is pinned to this, not map iteration order.
    order: Vec<(String, u16)>,
}

pub struct PortDetector {
    sessions: Arc<SessionManager>,
    introspect: Arc<dyn ProcessIntrospection>,
    bus: EventBus,
    cache: Mutex<DetectorCache>,
    /// Guards against overlapping full sweeps when one tick runs long.
    sweeping: AtomicBool,
    pending_hints: Mutex<HashSet<String>>,
    config: RuntimeConfig,
}

impl PortDetector {
    pub fn new(
        sessions: Arc<SessionManager>,
        introspect: Arc<dyn ProcessIntrospection>,
        bus: EventBus,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            introspect,
            bus,
            cache: Mutex::new(DetectorCache::default()),
            sweeping: AtomicBool::new(false),
            pending_hints: Mutex::new(HashSet::new()),
            config,
        })
    }

    /// Start the periodic sweep and the output-hint listener.
    pub fn spawn_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let sweeper = Arc::clone(self);
        let sweep_task = tokio::spawn(async move {
            let mut ticker = interval(sweeper.config.scan_interval());
            loop {
                ticker.tick().await;
                sweeper.sweep().await;
            }
        });

        let hinter = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        let hint_task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::SessionData { pane_id, data }) => {
                        if contains_port_hint(&String::from_utf8_lossy(&data)) {
                            hinter.schedule_hint_scan(pane_id).await;
                        }
                    }
                    Ok(Event::SessionExit { pane_id, .. }) => {
                        hinter.drop_pane(&pane_id).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "hint listener lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        vec![sweep_task, hint_task]
    }

    /// One full sweep: sequential per-session scans to bound OS-call
    /// concentration. No-op if a previous sweep is still running.
    pub async fn sweep(&self) {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            debug!("previous sweep still running, skipping tick");
            return;
        }

        let snapshot = self.sessions.snapshot().await;
        for info in snapshot.iter().filter(|s| s.is_alive) {
            self.scan_pane(info).await;
        }

        // Panes that left the session table entirely lose their ports.
        let live: HashSet<&str> = snapshot.iter().map(|s| s.pane_id.as_str()).collect();
        let stale: Vec<String> = {
            let cache = self.cache.lock().await;
            cache
                .panes
                .keys()
                .filter(|pane| !live.contains(pane.as_str()))
                .cloned()
                .collect()
        };
        for pane in stale {
            self.drop_pane(&pane).await;
        }

        self.sweeping.store(false, Ordering::SeqCst);
    }

    /// Scan one pane's process tree and diff against the previous result.
    /// Adds and removals are emitted in observation order; a port missing
    /// from a single scan is removed immediately.
    pub async fn scan_pane(&self, info: &SessionInfo) {
        let introspect = Arc::clone(&self.introspect);
        let root = info.pid;
        let sockets = tokio::task::spawn_blocking(move || {
            let pids = introspect.process_tree(root);
            introspect.listening_sockets(&pids)
        })
        .await
        .unwrap_or_default();

        let label = infer_service_label(&info.cwd);
        let observed: Vec<_> = sockets
            .into_iter()
            .filter(|s| !DENYLISTED_PORTS.contains(&s.port))
            .collect();
        let observed_ports: HashSet<u16> = observed.iter().map(|s| s.port).collect();

        let mut cache = self.cache.lock().await;
        let current = cache.panes.entry(info.pane_id.clone()).or_default();

        let removed: Vec<u16> = current
            .iter()
            .filter(|p| !observed_ports.contains(&p.port))
            .map(|p| p.port)
            .collect();
        current.retain(|p| observed_ports.contains(&p.port));

        let known: HashSet<u16> = current.iter().map(|p| p.port).collect();
        let mut added = Vec::new();
        for socket in observed {
            if !known.contains(&socket.port) {
                let port = DetectedPort {
                    port: socket.port,
                    address: socket.address,
                    pid: socket.pid,
                    process_name: socket.process_name,
                    service_label: label.clone(),
                    pane_id: info.pane_id.clone(),
                    workspace_id: info.workspace_id.clone(),
                    first_seen: now_millis(),
                };
                current.push(port.clone());
                added.push(port);
            }
        }

        for port in &removed {
            cache
                .order
                .retain(|(pane, p)| !(pane == &info.pane_id && p == port));
        }
        for port in &added {
            cache.order.push((info.pane_id.clone(), port.port));
        }
        drop(cache);

        for port in removed {
            debug!(pane_id = %info.pane_id, port, "port gone");
            self.bus.publish(Event::PortRemove {
                pane_id: info.pane_id.clone(),
                port,
            });
        }
        for port in added {
            debug!(pane_id = %port.pane_id, port = port.port, label = %port.service_label, "port detected");
            self.bus.publish(Event::PortAdd(port));
        }
    }

    /// Forget everything for a pane (session exited or was removed) and
    /// emit a removal per previously reported port.
    pub async fn drop_pane(&self, pane_id: &str) {
        let removed = {
            let mut cache = self.cache.lock().await;
            cache.order.retain(|(pane, _)| pane != pane_id);
            cache.panes.remove(pane_id).unwrap_or_default()
        };
        for port in removed {
            self.bus.publish(Event::PortRemove {
                pane_id: pane_id.to_string(),
                port: port.port,
            });
        }
    }

    /// All detected ports in global first-seen order.
    pub async fn detected_ports(&self) -> Vec<DetectedPort> {
        let cache = self.cache.lock().await;
        cache
            .order
            .iter()
            .filter_map(|(pane, port)| {
                cache
                    .panes
                    .get(pane)
                    .and_then(|ports| ports.iter().find(|p| p.port == *port))
            })
            .cloned()
            .collect()
    }

    pub async fn ports_for_pane(&self, pane_id: &str) -> Vec<DetectedPort> {
        let cache = self.cache.lock().await;
        cache.panes.get(pane_id).cloned().unwrap_or_default()
    }

    /// Debounced out-of-cycle scan for one pane, fired shortly after an
    /// output hint so the server has a moment to finish binding.
    async fn schedule_hint_scan(self: &Arc<Self>, pane_id: String) {
        {
            let mut pending = self.pending_hints.lock().await;
            if !pending.insert(pane_id.clone()) {
                return; // a hint scan is already queued for this pane
            }
        }
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            sleep(detector.config.hint_settle()).await;
            detector.pending_hints.lock().await.remove(&pane_id);
            let snapshot = detector.sessions.snapshot().await;
            if let Some(info) = snapshot
                .iter()
                .find(|s| s.pane_id == pane_id && s.is_alive)
            {
                debug!(pane_id = %pane_id, "hint-triggered scan");
                detector.scan_pane(info).await;
            }
        });
    }
}

/// Service label for a working directory: the segment after `apps/` or
/// `packages/` (monorepo conventions), the project segment after
/// `worktrees/`, or the directory's basename.
pub fn infer_service_label(cwd: &str) -> String {
    let segments: Vec<&str> = cwd.split('/').filter(|s| !s.is_empty()).collect();

    for marker in ["apps", "packages"] {
        if let Some(pos) = segments.iter().position(|s| *s == marker) {
            if let Some(name) = segments.get(pos + 1) {
                return name.to_string();
            }
        }
    }
    // worktrees/<project>/<branch>: the project names the service, not
    // the branch.
    if let Some(pos) = segments.iter().position(|s| *s == "worktrees") {
        if let Some(project) = segments.get(pos + 1) {
            return project.to_string();
        }
    }
    segments
        .last()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "shell".to_string())
}

static HINT_RE: OnceLock<Regex> = OnceLock::new();

/// Textual evidence that a server just started in this output chunk.
pub fn contains_port_hint(text: &str) -> bool {
    let re = HINT_RE.get_or_init(|| {
        Regex::new(
            r"(?i)listening on (?:port )?\S*\d{2,5}|(?:localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):\d{2,5}|https?://[^\s:/]+:\d{2,5}|(?:^|\s):\d{2,5}(?:[/\s]|$)",
        )
        .expect("hint pattern is valid")
    });
    re.is_match(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStore;
    use crate::procinfo::SocketInfo;
    use std::net::{IpAddr, Ipv4Addr};

    // ── Label inference ─────────────────────────────────────────────

    #[test]
    fn label_from_apps_convention() {
        assert_eq!(infer_service_label("/repo/apps/web"), "web");
        assert_eq!(infer_service_label("/repo/apps/api/src/routes"), "api");
    }

    #[test]
    fn label_from_packages_convention() {
        assert_eq!(infer_service_label("/repo/packages/ui"), "ui");
    }

    #[test]
    fn label_from_worktree_uses_project_not_branch() {
        assert_eq!(
            infer_service_label("/home/me/worktrees/myproj/feature-x"),
            "myproj"
        );
    }

    #[test]
    fn label_falls_back_to_basename() {
        assert_eq!(infer_service_label("/home/me/code/thing"), "thing");
        assert_eq!(infer_service_label("/"), "shell");
    }

    // ── Hint detection ──────────────────────────────────────────────

    #[test]
    fn hints_match_common_server_banners() {
        assert!(contains_port_hint("  Local:   http://localhost:5173/"));
        assert!(contains_port_hint("Listening on port 3000"));
        assert!(contains_port_hint("server listening on 0.0.0.0:8080"));
        assert!(contains_port_hint("ready at http://127.0.0.1:4000"));
    }

    #[test]
    fn bare_port_form_is_a_hint() {
        // Some servers print only `:<port>`, no host at all.
        assert!(contains_port_hint("Server running at :3000"));
        assert!(contains_port_hint("ready on :8080/"));
    }

    #[test]
    fn plain_output_is_not_a_hint() {
        assert!(!contains_port_hint("compiled successfully in 320ms"));
        assert!(!contains_port_hint("$ ls -la"));
        assert!(!contains_port_hint("3000 files changed"));
        // Clock-style colons are not port announcements.
        assert!(!contains_port_hint("finished at 12:30"));
    }

    // ── Diffing with a fake introspector ────────────────────────────

    struct FakeIntrospection {
        sockets: std::sync::Mutex<Vec<SocketInfo>>,
    }

    impl FakeIntrospection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sockets: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn set(&self, sockets: Vec<SocketInfo>) {
            *self.sockets.lock().unwrap() = sockets;
        }
    }

    impl ProcessIntrospection for FakeIntrospection {
        fn process_tree(&self, root: i32) -> Vec<i32> {
            vec![root]
        }

        fn listening_sockets(&self, _pids: &[i32]) -> Vec<SocketInfo> {
            self.sockets.lock().unwrap().clone()
        }
    }

    fn socket(port: u16) -> SocketInfo {
        SocketInfo {
            port,
            pid: 4321,
            process_name: "node".into(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    fn pane(pane_id: &str, cwd: &str) -> SessionInfo {
        SessionInfo {
            pane_id: pane_id.into(),
            workspace_id: "ws1".into(),
            pid: 4321,
            cwd: cwd.into(),
            is_alive: true,
        }
    }

    fn detector(fake: Arc<FakeIntrospection>) -> (Arc<PortDetector>, EventBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            history_root: dir.path().to_path_buf(),
            ..RuntimeConfig::default()
        };
        let bus = EventBus::new(64);
        let history = Arc::new(HistoryStore::new(config.history_root.clone()));
        let sessions = SessionManager::new(config.clone(), history, bus.clone());
        let det = PortDetector::new(sessions, fake, bus.clone(), config);
        (det, bus, dir)
    }

    #[tokio::test]
    async fn add_then_remove_emits_exactly_one_event_each() {
        let fake = FakeIntrospection::new();
        let (det, bus, _dir) = detector(Arc::clone(&fake));
        let mut rx = bus.subscribe();
        let info = pane("p1", "/repo/apps/web");

        fake.set(vec![socket(5173)]);
        det.scan_pane(&info).await;
        match rx.recv().await.unwrap() {
            Event::PortAdd(p) => {
                assert_eq!(p.port, 5173);
                assert_eq!(p.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
                assert_eq!(p.service_label, "web");
                assert_eq!(p.pane_id, "p1");
            }
            other => panic!("expected PortAdd, got {:?}", other),
        }

        // Same scan result again: no new events.
        det.scan_pane(&info).await;
        assert!(rx.try_recv().is_err());

        fake.set(vec![]);
        det.scan_pane(&info).await;
        match rx.recv().await.unwrap() {
            Event::PortRemove { pane_id, port } => {
                assert_eq!(pane_id, "p1");
                assert_eq!(port, 5173);
            }
            other => panic!("expected PortRemove, got {:?}", other),
        }

        // And nothing further for that (pane, port) pair.
        det.scan_pane(&info).await;
        assert!(rx.try_recv().is_err());
        assert!(det.detected_ports().await.is_empty());
    }

    #[tokio::test]
    async fn denylisted_ports_are_never_reported() {
        let fake = FakeIntrospection::new();
        let (det, bus, _dir) = detector(Arc::clone(&fake));
        let mut rx = bus.subscribe();

        fake.set(vec![socket(22), socket(5432), socket(3000)]);
        det.scan_pane(&pane("p1", "/repo")).await;

        match rx.recv().await.unwrap() {
            Event::PortAdd(p) => assert_eq!(p.port, 3000),
            other => panic!("expected PortAdd, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn detected_ports_keep_first_seen_order() {
        let fake = FakeIntrospection::new();
        let (det, _bus, _dir) = detector(Arc::clone(&fake));

        fake.set(vec![socket(3000)]);
        det.scan_pane(&pane("p1", "/repo/apps/web")).await;
        fake.set(vec![socket(3000), socket(4000)]);
        det.scan_pane(&pane("p1", "/repo/apps/web")).await;
        fake.set(vec![socket(9000)]);
        det.scan_pane(&pane("p2", "/repo/apps/api")).await;

        let ports: Vec<u16> = det.detected_ports().await.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![3000, 4000, 9000]);
    }

    #[tokio::test]
    async fn drop_pane_removes_all_its_ports() {
        let fake = FakeIntrospection::new();
        let (det, bus, _dir) = detector(Arc::clone(&fake));

        fake.set(vec![socket(3000), socket(4000)]);
        det.scan_pane(&pane("p1", "/repo")).await;

        let mut rx = bus.subscribe();
        det.drop_pane("p1").await;

        let mut removed = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                Event::PortRemove { port, .. } => removed.push(port),
                other => panic!("expected PortRemove, got {:?}", other),
            }
        }
        removed.sort_unstable();
        assert_eq!(removed, vec![3000, 4000]);
        assert!(det.detected_ports().await.is_empty());
    }
}

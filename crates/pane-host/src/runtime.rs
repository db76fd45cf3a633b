//! Composition root. Owns the one authoritative session table and port
//! cache per process; everything is explicitly constructed and injected,
//! nothing is a module-level singleton.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::detect::PortDetector;
use crate::error::Result;
use crate::events::EventBus;
use crate::history::HistoryStore;
use crate::procinfo::ProcfsIntrospection;
use crate::proxy::{ProxyManager, ProxyPortConfig};
use crate::session::SessionManager;

pub struct PaneRuntime {
    pub bus: EventBus,
    pub sessions: Arc<SessionManager>,
    pub detector: Arc<PortDetector>,
    pub proxy: Arc<ProxyManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl PaneRuntime {
    /// Wire up the whole runtime: event bus, history store, session
    /// manager, port detector (sweep + hint tasks), and proxy routes for
    /// the workspace's canonical ports.
    pub async fn start(config: RuntimeConfig, proxy_ports: Vec<ProxyPortConfig>) -> Result<Self> {
        let bus = EventBus::default();
        let history = Arc::new(HistoryStore::new(config.history_root.clone()));
        let sessions = SessionManager::new(config.clone(), history, bus.clone());

        let detector = PortDetector::new(
            Arc::clone(&sessions),
            Arc::new(ProcfsIntrospection),
            bus.clone(),
            config.clone(),
        );
        let mut tasks = detector.spawn_tasks();

        let proxy = ProxyManager::bind(bus.clone(), &proxy_ports, config.connect_timeout()).await;
        tasks.push(proxy.spawn_retarget_task(Arc::clone(&detector)));

        info!(
            routes = proxy_ports.len(),
            "terminal session runtime started"
        );
        Ok(Self {
            bus,
            sessions,
            detector,
            proxy,
            tasks,
        })
    }

    /// Orderly shutdown: stop background tasks, close proxy routes, then
    /// terminate sessions with bounded waits.
    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.proxy.shutdown().await;
        self.sessions.cleanup().await;
        info!("terminal session runtime stopped");
    }
}

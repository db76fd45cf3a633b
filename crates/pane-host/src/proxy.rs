//! Canonical-port proxying: one persistent listening socket per
//! configured port, forwarding byte-for-byte to whatever backend port is
//! currently detected. Retargeting swaps a watch value; the canonical
//! socket is never closed or rebound, so long-lived connections to an
//! unchanged backend survive unrelated port churn. Plain HTTP and
//! WebSocket upgrades both pass through untouched.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::detect::{DetectedPort, PortDetector};
use crate::events::{Event, EventBus};

/// One workspace-configured canonical port, optionally tied to a service
/// label. Supplied at workspace activation; changing it means rebuilding
/// the manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPortConfig {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Externally visible route state.
#[derive(Clone, Debug)]
pub struct RouteStatus {
    pub canonical_port: u16,
    pub label: Option<String>,
    pub target: Option<SocketAddr>,
    pub active: bool,
}

struct Route {
    canonical_port: u16,
    label: Option<String>,
    target_tx: watch::Sender<Option<SocketAddr>>,
    active: bool,
    accept_task: Option<JoinHandle<()>>,
}

pub struct ProxyManager {
    routes: Mutex<Vec<Route>>,
    bus: EventBus,
    connect_timeout: Duration,
}

impl ProxyManager {
    /// Bind every configured canonical port. A port that cannot be bound
    /// (already in use) is reported once and stays inactive for the
    /// lifetime of this configuration; it is not retried.
    pub async fn bind(
        bus: EventBus,
        configs: &[ProxyPortConfig],
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let mut routes = Vec::with_capacity(configs.len());
        for config in configs {
            let (target_tx, target_rx) = watch::channel(None);
            match TcpListener::bind(("127.0.0.1", config.port)).await {
                Ok(listener) => {
                    info!(port = config.port, label = ?config.label, "proxy route bound");
                    let accept_task = tokio::spawn(Self::accept_loop(
                        listener,
                        target_rx,
                        connect_timeout,
                    ));
                    routes.push(Route {
                        canonical_port: config.port,
                        label: config.label.clone(),
                        target_tx,
                        active: true,
                        accept_task: Some(accept_task),
                    });
                }
                Err(err) => {
                    error!(port = config.port, %err, "failed to bind canonical port, route disabled");
                    routes.push(Route {
                        canonical_port: config.port,
                        label: config.label.clone(),
                        target_tx,
                        active: false,
                        accept_task: None,
                    });
                }
            }
        }
        Arc::new(Self {
            routes: Mutex::new(routes),
            bus,
            connect_timeout,
        })
    }

    /// Recompute every route's target from the detector's current view.
    /// Labeled routes take the first detected port with a matching
    /// service label; unlabeled routes take the first detected port in
    /// first-seen order.
    pub async fn retarget(&self, detected: &[DetectedPort]) {
        let mut routes = self.routes.lock().await;
        for route in routes.iter_mut().filter(|r| r.active) {
            let desired = resolve_target(route.label.as_deref(), detected);
            let current = *route.target_tx.borrow();
            if current != desired {
                debug!(
                    port = route.canonical_port,
                    from = ?current,
                    to = ?desired,
                    "proxy route retargeted"
                );
                let _ = route.target_tx.send(desired);
                self.bus.publish(Event::ProxyUpdated {
                    canonical_port: route.canonical_port,
                    target: desired,
                });
            }
        }
    }

    /// React to detector events for the life of the manager.
    pub fn spawn_retarget_task(self: &Arc<Self>, detector: Arc<PortDetector>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(Event::PortAdd(_)) | Ok(Event::PortRemove { .. }) => {
                        let detected = detector.detected_ports().await;
                        manager.retarget(&detected).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "proxy retarget listener lagged");
                        let detected = detector.detected_ports().await;
                        manager.retarget(&detected).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub async fn routes(&self) -> Vec<RouteStatus> {
        let routes = self.routes.lock().await;
        routes
            .iter()
            .map(|r| RouteStatus {
                canonical_port: r.canonical_port,
                label: r.label.clone(),
                target: *r.target_tx.borrow(),
                active: r.active,
            })
            .collect()
    }

    /// Stop accepting on every route. In-flight connections finish on
    /// their own.
    pub async fn shutdown(&self) {
        let mut routes = self.routes.lock().await;
        for route in routes.iter_mut() {
            if let Some(task) = route.accept_task.take() {
                task.abort();
            }
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        target_rx: watch::Receiver<Option<SocketAddr>>,
        connect_timeout: Duration,
    ) {
        loop {
            let (client, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(%err, "proxy accept failed");
                    continue;
                }
            };
            let target = *target_rx.borrow();
            tokio::spawn(handle_connection(client, target, connect_timeout));
        }
    }
}

/// Pick the backend for a route. Pinned to first-seen order for
/// unlabeled routes so the choice does not drift between scans. Connects
/// to the address the backend listens on; wildcard binds are reachable
/// through the matching loopback.
pub fn resolve_target(label: Option<&str>, detected: &[DetectedPort]) -> Option<SocketAddr> {
    let port = match label {
        Some(label) => detected.iter().find(|p| p.service_label == label),
        None => detected.first(),
    }?;
    let ip = match port.address {
        IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        addr => addr,
    };
    Some(SocketAddr::new(ip, port.port))
}

async fn handle_connection(
    mut client: TcpStream,
    target: Option<SocketAddr>,
    connect_timeout: Duration,
) {
    let Some(addr) = target else {
        // Defined "no backend" answer instead of hanging or refusing.
        respond_html(&mut client, 503, "Service Unavailable", "No backend is running yet. Start the service in its terminal session and this page will begin forwarding automatically.").await;
        return;
    };

    let mut backend = match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        _ => {
            // Transient per-request failure, never a proxy-wide one.
            respond_html(&mut client, 502, "Bad Gateway", "The backend did not accept the connection. It may still be starting up.").await;
            return;
        }
    };

    if let Err(err) = copy_bidirectional(&mut client, &mut backend).await {
        debug!(%err, backend = %addr, "proxied connection ended with error");
    }
}

async fn respond_html(client: &mut TcpStream, status: u16, reason: &str, message: &str) {
    let body = format!(
        "<!DOCTYPE html><html><head><title>{status} {reason}</title></head>\
         <body><h1>{status} {reason}</h1><p>{message}</p></body></html>"
    );
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = client.write_all(response.as_bytes()).await;
    let _ = client.shutdown().await;
}

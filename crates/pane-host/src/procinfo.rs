//! OS process/port introspection behind a trait so the detector can be
//! driven by a fake in tests. The production implementation reads /proc.
//!
//! Everything here is best effort: a pid that disappears mid-scan or a
//! fd table we cannot read yields an empty result for that pid, never an
//! error, so one misbehaving process cannot stall detection for the
//! whole tree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;

use procfs::net::TcpState;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SocketInfo {
    pub port: u16,
    pub pid: i32,
    pub process_name: String,
    pub address: IpAddr,
}

pub trait ProcessIntrospection: Send + Sync {
    /// Full descendant pid tree rooted at `root`, including `root`.
    fn process_tree(&self, root: i32) -> Vec<i32>;

    /// TCP sockets in LISTEN state owned by any of `pids`.
    fn listening_sockets(&self, pids: &[i32]) -> Vec<SocketInfo>;
}

/// /proc-backed implementation.
pub struct ProcfsIntrospection;

impl ProcessIntrospection for ProcfsIntrospection {
    fn process_tree(&self, root: i32) -> Vec<i32> {
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        match procfs::process::all_processes() {
            Ok(procs) => {
                for proc in procs.flatten() {
                    if let Ok(stat) = proc.stat() {
                        children.entry(stat.ppid).or_default().push(stat.pid);
                    }
                }
            }
            Err(err) => {
                debug!(%err, "process enumeration failed");
                return vec![root];
            }
        }

        let mut tree = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(pid) = queue.pop_front() {
            tree.push(pid);
            if let Some(kids) = children.get(&pid) {
                queue.extend(kids);
            }
        }
        tree
    }

    fn listening_sockets(&self, pids: &[i32]) -> Vec<SocketInfo> {
        // inode -> local address for every LISTEN socket on the host
        let mut listeners: HashMap<u64, std::net::SocketAddr> = HashMap::new();
        for entries in [procfs::net::tcp(), procfs::net::tcp6()] {
            if let Ok(entries) = entries {
                for entry in entries {
                    if entry.state == TcpState::Listen {
                        listeners.insert(entry.inode, entry.local_address);
                    }
                }
            }
        }

        let mut seen: HashSet<(i32, u16)> = HashSet::new();
        let mut sockets = Vec::new();
        for &pid in pids {
            // Per-pid failures are swallowed: the process may have exited,
            // or its fd table may be unreadable.
            let Ok(proc) = procfs::process::Process::new(pid) else {
                continue;
            };
            let name = proc
                .stat()
                .map(|s| s.comm)
                .unwrap_or_else(|_| String::new());
            let Ok(fds) = proc.fd() else {
                continue;
            };
            for fd in fds.flatten() {
                if let procfs::process::FDTarget::Socket(inode) = fd.target {
                    if let Some(addr) = listeners.get(&inode) {
                        if seen.insert((pid, addr.port())) {
                            sockets.push(SocketInfo {
                                port: addr.port(),
                                pid,
                                process_name: name.clone(),
                                address: addr.ip(),
                            });
                        }
                    }
                }
            }
        }
        sockets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_tree_contains_self() {
        let tree = ProcfsIntrospection.process_tree(std::process::id() as i32);
        assert!(tree.contains(&(std::process::id() as i32)));
    }

    #[test]
    fn unknown_pid_tree_is_just_the_root() {
        // pid 0 has no /proc entry; the tree still contains the root.
        let tree = ProcfsIntrospection.process_tree(0);
        assert_eq!(tree[0], 0);
    }

    #[test]
    fn listening_sockets_finds_our_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let pid = std::process::id() as i32;
        let sockets = ProcfsIntrospection.listening_sockets(&[pid]);
        assert!(
            sockets.iter().any(|s| s.port == port && s.pid == pid),
            "expected port {} in {:?}",
            port,
            sockets
        );
    }

    #[test]
    fn dead_pid_yields_nothing() {
        let sockets = ProcfsIntrospection.listening_sockets(&[-1]);
        assert!(sockets.is_empty());
    }
}

// Linux procfs-based socket mapper

use super::{SnapshotScope, SocketMapperBackend};
use crate::backends::{BackendCapabilities, BackendPriority};
use crate::error::SnifferError;
use crate::model::{ConnectionKey, Protocol, SocketEntry, UNKNOWN_PROCESS};
use ::procfs::ProcError;
use ::procfs::process::{FDTarget, all_processes};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Socket mapper using Linux /proc filesystem
///
/// This backend reads socket information from:
/// - /proc/net/{tcp,tcp6,udp,udp6} - for endpoints and socket inodes
/// - /proc/[pid]/fd/ - to find which process holds each inode
pub struct ProcfsSocketMapper;

impl ProcfsSocketMapper {
    pub fn new() -> Result<Self, SnifferError> {
        if !Self::is_available() {
            return Err(SnifferError::Unsupported(
                "procfs not available (is /proc mounted?)".to_string(),
            ));
        }
        Ok(Self)
    }

    /// socket inode -> (pid, process name)
    fn scan_owners(&self, scope: &SnapshotScope) -> Result<HashMap<u64, (i32, String)>, SnifferError> {
        let mut owners = HashMap::new();
        let mut scanned = 0usize;
        let mut skipped = 0usize;

        for proc_result in all_processes().map_err(map_proc_error)? {
            if scope.expired() {
                log::debug!(
                    "Deadline reached after scanning {} processes, returning partial owners",
                    scanned
                );
                break;
            }

            let Ok(process) = proc_result else {
                skipped += 1;
                continue;
            };
            let pid = process.pid();
            if !scope.includes(pid) {
                continue;
            }

            // Processes exit or deny access between listing and reading
            let Ok(fds) = process.fd() else {
                skipped += 1;
                continue;
            };
            scanned += 1;

            let mut name = None;
            for fd_info in fds.flatten() {
                if let FDTarget::Socket(inode) = fd_info.target {
                    let name = name.get_or_insert_with(|| match process.stat() {
                        Ok(stat) => stat.comm,
                        Err(_) => format!("PID {}", pid),
                    });
                    owners.insert(inode, (pid, name.clone()));
                }
            }
        }

        log::trace!(
            "Scanned {} processes ({} unreadable), {} socket inodes",
            scanned,
            skipped,
            owners.len()
        );
        Ok(owners)
    }
}

fn map_proc_error(err: ProcError) -> SnifferError {
    match err {
        ProcError::PermissionDenied(path) => SnifferError::PermissionDenied(format!(
            "cannot read {}",
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| "/proc".to_string())
        )),
        other => SnifferError::Io(std::io::Error::other(other.to_string())),
    }
}

fn unowned_entry(
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
    inode: u64,
    state: String,
) -> SocketEntry {
    SocketEntry {
        key: ConnectionKey::new(protocol, local.ip(), local.port(), remote.ip(), remote.port()),
        pid: None,
        process_name: UNKNOWN_PROCESS.to_string(),
        inode,
        state: Some(state),
    }
}

/// A missing table (e.g. IPv6 disabled) is not an error; anything else is
fn table_or_empty<T>(table: &str, result: ::procfs::ProcResult<Vec<T>>) -> Result<Vec<T>, SnifferError> {
    match result {
        Ok(entries) => Ok(entries),
        Err(ProcError::NotFound(_)) => {
            log::debug!("/proc/net/{} not present, skipping", table);
            Ok(Vec::new())
        }
        Err(e) => Err(map_proc_error(e)),
    }
}

impl SocketMapperBackend for ProcfsSocketMapper {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Best
    }

    fn is_available() -> bool {
        std::path::Path::new("/proc/net/tcp").exists()
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            ipv4_support: true,
            ipv6_support: true,
            per_process: true,
            per_connection: true,
        }
    }

    fn snapshot(&self, scope: &SnapshotScope) -> Result<Vec<SocketEntry>, SnifferError> {
        let mut entries = Vec::new();

        for (table, result) in [("tcp", ::procfs::net::tcp()), ("tcp6", ::procfs::net::tcp6())] {
            for entry in table_or_empty(table, result)? {
                entries.push(unowned_entry(
                    Protocol::Tcp,
                    entry.local_address,
                    entry.remote_address,
                    entry.inode,
                    format!("{:?}", entry.state),
                ));
            }
        }

        for (table, result) in [("udp", ::procfs::net::udp()), ("udp6", ::procfs::net::udp6())] {
            for entry in table_or_empty(table, result)? {
                entries.push(unowned_entry(
                    Protocol::Udp,
                    entry.local_address,
                    entry.remote_address,
                    entry.inode,
                    format!("{:?}", entry.state),
                ));
            }
        }

        let owners = self.scan_owners(scope)?;
        for entry in &mut entries {
            // inode 0 means the socket is no longer held (TIME_WAIT etc.)
            if entry.inode == 0 {
                continue;
            }
            if let Some((pid, name)) = owners.get(&entry.inode) {
                entry.pid = Some(*pid);
                entry.process_name = name.clone();
            }
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    #[test]
    fn test_expired_deadline_returns_unowned_sockets() {
        if !ProcfsSocketMapper::is_available() {
            return;
        }
        let mapper = ProcfsSocketMapper::new().unwrap();
        let scope = SnapshotScope {
            deadline: Instant::now() - Duration::from_secs(1),
            pids: HashSet::new(),
        };

        // Nothing gets scanned, so every socket is left with the unknown owner
        let entries = mapper.snapshot(&scope).unwrap();
        assert!(entries.iter().all(|e| e.pid.is_none()));
        assert!(entries.iter().all(|e| e.process_name == UNKNOWN_PROCESS));
    }

    #[test]
    fn test_own_socket_is_attributed() {
        if !ProcfsSocketMapper::is_available() {
            return;
        }
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let me = std::process::id() as i32;

        let mapper = ProcfsSocketMapper::new().unwrap();
        let scope = SnapshotScope {
            deadline: Instant::now() + Duration::from_secs(30),
            pids: [me].into_iter().collect(),
        };

        let entries = mapper.snapshot(&scope).unwrap();
        let ours = entries
            .iter()
            .find(|e| e.key.protocol == Protocol::Tcp && e.key.local_port == port)
            .expect("listener should be in /proc/net/tcp");
        assert_eq!(ours.pid, Some(me));
    }

    #[test]
    fn test_permission_denied_maps_to_sniffer_error() {
        let err = map_proc_error(ProcError::PermissionDenied(None));
        assert!(matches!(err, SnifferError::PermissionDenied(_)));
    }
}

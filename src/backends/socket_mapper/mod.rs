// Open-socket snapshots and their owning processes
//
// The mechanism is platform specific:
// - Linux: procfs (/proc/net/tcp and /proc/[pid]/fd)
// - other unixes: lsof

use crate::backends::{BackendCapabilities, BackendPriority};
use crate::error::SnifferError;
use crate::model::SocketEntry;
use std::collections::HashSet;
use std::time::Instant;

pub mod lsof;
#[cfg(target_os = "linux")]
pub mod procfs;

pub use self::lsof::LsofSocketMapper;
#[cfg(target_os = "linux")]
pub use self::procfs::ProcfsSocketMapper;

/// Limits a backend should honor while taking a snapshot
#[derive(Debug, Clone)]
pub struct SnapshotScope {
    /// Past this point a backend returns what it has so far
    pub deadline: Instant,
    /// Only look at these processes (empty = all)
    pub pids: HashSet<i32>,
}

impl SnapshotScope {
    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn includes(&self, pid: i32) -> bool {
        self.pids.is_empty() || self.pids.contains(&pid)
    }
}

/// Platform mechanism for listing open sockets and who owns them
pub trait SocketMapperBackend: Send + Sync {
    /// Backend name (e.g., "procfs", "lsof")
    fn name(&self) -> &'static str;

    /// Backend priority for auto-selection
    fn priority(&self) -> BackendPriority;

    /// Check if this backend is available on the current system
    fn is_available() -> bool
    where
        Self: Sized;

    fn capabilities(&self) -> BackendCapabilities;

    /// Every open TCP/UDP socket, with its owner when it could be found.
    /// Sockets without a known owner carry `pid: None` and the unknown
    /// process name.
    fn snapshot(&self, scope: &SnapshotScope) -> Result<Vec<SocketEntry>, SnifferError>;
}

/// Socket mapper backend metadata for selection
#[derive(Debug, Clone)]
pub struct SocketMapperInfo {
    pub name: &'static str,
    pub priority: BackendPriority,
    pub available: bool,
}

/// Every socket mapper this platform knows about, best first
pub fn detect_socket_mappers() -> Vec<SocketMapperInfo> {
    let mut mappers = Vec::new();

    #[cfg(target_os = "linux")]
    mappers.push(SocketMapperInfo {
        name: "procfs",
        priority: BackendPriority::Best,
        available: ProcfsSocketMapper::is_available(),
    });

    mappers.push(SocketMapperInfo {
        name: "lsof",
        priority: BackendPriority::Good,
        available: LsofSocketMapper::is_available(),
    });

    mappers.sort_by(|a, b| b.priority.cmp(&a.priority));
    mappers
}

fn instantiate(name: &str) -> Result<Box<dyn SocketMapperBackend>, SnifferError> {
    match name {
        #[cfg(target_os = "linux")]
        "procfs" => Ok(Box::new(ProcfsSocketMapper::new()?)),
        "lsof" => Ok(Box::new(LsofSocketMapper::new()?)),
        other => Err(SnifferError::InvalidOptions(format!(
            "unknown socket mapper: {}",
            other
        ))),
    }
}

/// Pick a socket mapper. An explicit preference must exist and be available;
/// otherwise the highest-priority available backend wins.
pub fn select_socket_mapper(
    preference: Option<&str>,
) -> Result<Box<dyn SocketMapperBackend>, SnifferError> {
    if let Some(name) = preference {
        return instantiate(name);
    }

    let best = detect_socket_mappers()
        .into_iter()
        .find(|info| info.available)
        .ok_or_else(|| {
            SnifferError::Unsupported("no socket mapper backend available on this system".into())
        })?;

    log::info!("Using socket mapper: {} ({})", best.name, best.priority);
    instantiate(best.name)
}

/// Takes per-tick socket snapshots through the selected backend and cleans
/// them up for matching against captured traffic.
pub struct SocketTableReader {
    backend: Box<dyn SocketMapperBackend>,
    pids: HashSet<i32>,
}

impl SocketTableReader {
    pub fn new(backend: Box<dyn SocketMapperBackend>, pids: &[i32]) -> Self {
        Self {
            backend,
            pids: pids.iter().copied().collect(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    /// Current open sockets. IPv4-mapped IPv6 endpoints are rewritten as
    /// IPv4 so they compare equal to captured IPv4 traffic.
    pub fn snapshot(&self, deadline: Instant) -> Result<Vec<SocketEntry>, SnifferError> {
        let started = Instant::now();
        let scope = SnapshotScope {
            deadline,
            pids: self.pids.clone(),
        };

        let mut entries = self.backend.snapshot(&scope)?;
        for entry in &mut entries {
            entry.key.local_addr = entry.key.local_addr.to_canonical();
            entry.key.remote_addr = entry.key.remote_addr.to_canonical();
        }

        if !self.pids.is_empty() {
            entries.retain(|e| e.pid.is_some_and(|pid| self.pids.contains(&pid)));
        }

        if scope.expired() {
            log::warn!(
                "Socket snapshot via {} overran its deadline ({:.0?}), result may be partial",
                self.backend.name(),
                started.elapsed()
            );
        }
        log::debug!(
            "Socket snapshot: {} sockets in {:.0?}",
            entries.len(),
            started.elapsed()
        );

        Ok(entries)
    }
}

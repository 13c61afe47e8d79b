// lsof-based socket mapper, for unixes without procfs

use super::{SnapshotScope, SocketMapperBackend};
use crate::backends::{BackendCapabilities, BackendPriority};
use crate::error::SnifferError;
use crate::model::{ConnectionKey, Protocol, SocketEntry};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

const LSOF_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Socket mapper using the lsof command
///
/// Runs `lsof -i -n -P -F pctPnT` and parses the field output. lsof has no
/// socket inodes to offer, so a pseudo-inode is derived from the owner and
/// the endpoints.
pub struct LsofSocketMapper;

impl LsofSocketMapper {
    pub fn new() -> Result<Self, SnifferError> {
        if !Self::is_available() {
            return Err(SnifferError::Unsupported("lsof command not found".to_string()));
        }
        Ok(Self)
    }
}

/// One file descriptor record being assembled from field lines
#[derive(Default)]
struct PendingSocket {
    is_ipv6: bool,
    protocol: Option<Protocol>,
    name: Option<String>,
    state: Option<String>,
}

/// Parse `lsof -F pctPnT` output.
///
/// Each process starts with `p<pid>` and `c<command>`; each of its
/// descriptors starts with `f<fd>` followed by `t` (IPv4/IPv6), `P`
/// (TCP/UDP), `n` (endpoints) and any number of `T` lines (`TST=` carries
/// the TCP state).
pub fn parse_lsof_output(output: &str) -> Vec<SocketEntry> {
    let mut entries = Vec::new();
    let mut pid: Option<i32> = None;
    let mut command = String::new();
    let mut pending: Option<PendingSocket> = None;

    let mut flush = |pending: &mut Option<PendingSocket>, pid: Option<i32>, command: &str| {
        if let Some(socket) = pending.take() {
            if let Some(entry) = finish_socket(socket, pid, command) {
                entries.push(entry);
            }
        }
    };

    for line in output.lines() {
        let Some(marker) = line.chars().next() else {
            continue;
        };
        let value = &line[marker.len_utf8()..];

        match marker {
            'p' => {
                flush(&mut pending, pid, &command);
                pid = value.parse().ok();
                command.clear();
            }
            'c' => command = value.to_string(),
            'f' => {
                flush(&mut pending, pid, &command);
                pending = Some(PendingSocket::default());
            }
            't' => {
                if let Some(socket) = pending.as_mut() {
                    socket.is_ipv6 = value == "IPv6";
                }
            }
            'P' => {
                if let Some(socket) = pending.as_mut() {
                    socket.protocol = match value {
                        "TCP" => Some(Protocol::Tcp),
                        "UDP" => Some(Protocol::Udp),
                        _ => None,
                    };
                }
            }
            'n' => {
                if let Some(socket) = pending.as_mut() {
                    socket.name = Some(value.to_string());
                }
            }
            'T' => {
                if let (Some(socket), Some(state)) = (pending.as_mut(), value.strip_prefix("ST=")) {
                    socket.state = Some(state.to_string());
                }
            }
            _ => {}
        }
    }
    flush(&mut pending, pid, &command);

    entries
}

fn finish_socket(socket: PendingSocket, pid: Option<i32>, command: &str) -> Option<SocketEntry> {
    let protocol = socket.protocol?;
    let name = socket.name?;
    let pid = pid?;

    let (local, remote) = match name.split_once("->") {
        Some((local, remote)) => (local, Some(remote)),
        None => (name.as_str(), None),
    };

    let (local_addr, local_port) = match parse_address(local, socket.is_ipv6) {
        Some(addr) => addr,
        None => {
            log::debug!("Failed to parse local address '{}'", local);
            return None;
        }
    };

    let (remote_addr, remote_port) = match remote {
        Some(remote) => match parse_address(remote, socket.is_ipv6) {
            Some(addr) => addr,
            None => {
                log::debug!("Failed to parse remote address '{}'", remote);
                return None;
            }
        },
        None => (unspecified(local_addr.is_ipv6()), 0),
    };

    let mut hasher = DefaultHasher::new();
    pid.hash(&mut hasher);
    (local_addr, local_port, remote_addr, remote_port).hash(&mut hasher);

    Some(SocketEntry {
        key: ConnectionKey::new(protocol, local_addr, local_port, remote_addr, remote_port),
        pid: Some(pid),
        process_name: command.to_string(),
        inode: hasher.finish(),
        state: socket.state,
    })
}

fn unspecified(ipv6: bool) -> IpAddr {
    if ipv6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
}

/// Parse "127.0.0.1:8080", "[::1]:8080", "*:8080" or "[fe80::1%en0]:5353"
fn parse_address(addr: &str, ipv6: bool) -> Option<(IpAddr, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = if port == "*" { 0 } else { port.parse().ok()? };

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    // Drop the zone index
    let host = host.split('%').next().unwrap_or(host);

    let ip = if host == "*" {
        unspecified(ipv6)
    } else {
        host.parse().ok()?
    };
    Some((ip, port))
}

impl SocketMapperBackend for LsofSocketMapper {
    fn name(&self) -> &'static str {
        "lsof"
    }

    fn priority(&self) -> BackendPriority {
        BackendPriority::Good // Works well, but spawns external process
    }

    fn is_available() -> bool {
        Command::new("which")
            .arg("lsof")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
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
        if scope.expired() {
            log::warn!("Skipping lsof snapshot, deadline already passed");
            return Ok(Vec::new());
        }

        let mut command = Command::new("lsof");
        command.args(["-i", "-n", "-P", "-F", "pctPnT"]);
        if !scope.pids.is_empty() {
            let pids: Vec<String> = scope.pids.iter().map(|p| p.to_string()).collect();
            // -a: AND the pid selection with -i instead of OR-ing it
            command.args(["-a", "-p", &pids.join(",")]);
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());

        let status = loop {
            match child.try_wait()? {
                Some(status) => break Some(status),
                None if scope.expired() => {
                    log::warn!("lsof overran the snapshot deadline, using partial output");
                    // Already exited if kill fails; wait reaps it either way
                    child.kill().ok();
                    child.wait()?;
                    break None;
                }
                None => thread::sleep(LSOF_POLL_INTERVAL),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        // lsof exits 1 when nothing matched, which is not a failure here
        if status.is_some_and(|s| !s.success()) && !stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&stderr);
            if stderr.contains("Permission denied") {
                return Err(SnifferError::PermissionDenied(stderr.trim().to_string()));
            }
            log::warn!("lsof reported errors: {}", stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&stdout);
        let complete = match status {
            Some(_) => &*stdout,
            None => complete_lines(&stdout),
        };
        Ok(parse_lsof_output(complete))
    }
}

/// Read a child pipe to the end on its own thread so the child never blocks
/// on a full pipe while we poll it
fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            // A killed child leaves whatever it wrote so far
            pipe.read_to_end(&mut buf).ok();
        }
        buf
    })
}

/// Output cut at the last newline; a killed lsof may leave half a field
fn complete_lines(output: &str) -> &str {
    match output.rfind('\n') {
        Some(end) => &output[..=end],
        None => "",
    }
}

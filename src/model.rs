// Connection, counter and snapshot types shared by the pipeline stages

use chrono::{DateTime, Local};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Process name used when a connection cannot be attributed to a process
pub const UNKNOWN_PROCESS: &str = "unknown";

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Protocol {
    Tcp,
    Udp,
    /// Any other IP protocol, keyed by its protocol number
    Other(u8),
}

impl Protocol {
    pub fn has_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Other(n) => write!(f, "ip/{}", n),
        }
    }
}

/// Direction of a packet relative to the monitored host
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Direction {
    Sent,
    Received,
}

/// Canonical identity of a flow from the monitored host's perspective.
///
/// Both directions of a flow map to the same key. For protocols without
/// ports (`Protocol::Other`) both ports are always 0.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ConnectionKey {
    pub protocol: Protocol,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

impl ConnectionKey {
    pub fn new(
        protocol: Protocol,
        local_addr: IpAddr,
        local_port: u16,
        remote_addr: IpAddr,
        remote_port: u16,
    ) -> Self {
        if protocol.has_ports() {
            Self {
                protocol,
                local_addr,
                local_port,
                remote_addr,
                remote_port,
            }
        } else {
            Self {
                protocol,
                local_addr,
                local_port: 0,
                remote_addr,
                remote_port: 0,
            }
        }
    }

    /// True for sockets not connected to a specific peer (listening TCP,
    /// unconnected UDP)
    pub fn is_unconnected(&self) -> bool {
        self.remote_addr.is_unspecified() || self.remote_port == 0
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.protocol.has_ports() {
            write!(
                f,
                "{} {} -> {}",
                self.protocol,
                std::net::SocketAddr::new(self.local_addr, self.local_port),
                std::net::SocketAddr::new(self.remote_addr, self.remote_port)
            )
        } else {
            write!(
                f,
                "{} {} -> {}",
                self.protocol, self.local_addr, self.remote_addr
            )
        }
    }
}

/// One row of the kernel's open-socket table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub key: ConnectionKey,
    pub pid: Option<i32>,
    pub process_name: String,
    /// Socket inode on Linux, a pseudo-inode where the OS has none
    pub inode: u64,
    pub state: Option<String>,
}

impl SocketEntry {
    pub fn is_attributed(&self) -> bool {
        self.pid.is_some()
    }
}

/// Byte and packet totals accumulated since the previous drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl Counters {
    pub fn add(&mut self, direction: Direction, bytes: u64) {
        match direction {
            Direction::Sent => {
                self.bytes_sent += bytes;
                self.packets_sent += 1;
            }
            Direction::Received => {
                self.bytes_received += bytes;
                self.packets_received += 1;
            }
        }
    }

    pub fn merge(&mut self, other: &Counters) {
        self.bytes_sent += other.bytes_sent;
        self.bytes_received += other.bytes_received;
        self.packets_sent += other.packets_sent;
        self.packets_received += other.packets_received;
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }

    pub fn total_packets(&self) -> u64 {
        self.packets_sent + self.packets_received
    }

    pub fn is_empty(&self) -> bool {
        self.total_packets() == 0
    }
}

/// All counters for one measurement interval
#[derive(Debug, Clone, PartialEq)]
pub struct Utilization {
    pub connections: HashMap<ConnectionKey, Counters>,
    /// Frames that were captured but could not be decoded into a connection
    pub unattributed: Counters,
    /// Wall time covered by this interval
    pub interval: Duration,
    pub drained_at: DateTime<Local>,
}

impl Utilization {
    pub fn total(&self) -> Counters {
        let mut total = self.unattributed;
        for counters in self.connections.values() {
            total.merge(counters);
        }
        total
    }
}

/// A connection with traffic in this interval, attributed to a process when
/// a matching socket was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStat {
    pub key: ConnectionKey,
    pub pid: Option<i32>,
    pub process_name: String,
    pub counters: Counters,
}

/// Traffic of one process summed over its connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessUsage {
    pub pid: Option<i32>,
    pub process_name: String,
    pub counters: Counters,
    pub connections: usize,
}

/// One tick's combined socket ownership and utilization snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Stat {
    pub utilization: Utilization,
    pub open_sockets: Vec<SocketEntry>,
    /// Sorted by connection key
    pub connections: Vec<ConnectionStat>,
}

impl Stat {
    pub fn total(&self) -> Counters {
        self.utilization.total()
    }

    /// Per-process totals, busiest first. Unattributed connections are
    /// grouped under a single `unknown` row.
    pub fn by_process(&self) -> Vec<ProcessUsage> {
        let mut grouped: BTreeMap<Option<i32>, ProcessUsage> = BTreeMap::new();
        for conn in &self.connections {
            let usage = grouped.entry(conn.pid).or_insert_with(|| ProcessUsage {
                pid: conn.pid,
                process_name: conn.process_name.clone(),
                counters: Counters::default(),
                connections: 0,
            });
            usage.counters.merge(&conn.counters);
            usage.connections += 1;
        }

        let mut usages: Vec<ProcessUsage> = grouped.into_values().collect();
        usages.sort_by(|a, b| {
            b.counters
                .total_bytes()
                .cmp(&a.counters.total_bytes())
                .then(a.pid.cmp(&b.pid))
        });
        usages
    }

    /// Distinct remote addresses with traffic this interval
    pub fn remote_addresses(&self) -> Vec<IpAddr> {
        let mut seen = HashSet::new();
        self.connections
            .iter()
            .map(|c| c.key.remote_addr)
            .filter(|addr| seen.insert(*addr))
            .collect()
    }
}

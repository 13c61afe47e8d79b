// Live per-connection counters shared between capture threads and the tick path

use crate::history::{Rate, StatHistory};
use crate::model::{
    ConnectionKey, ConnectionStat, Counters, Direction, Protocol, SocketEntry, Stat,
    UNKNOWN_PROCESS, Utilization,
};
use chrono::Local;
use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Owns the live counter map.
///
/// Capture threads call [`accumulate`](Self::accumulate); the driver calls
/// [`drain`](Self::drain) once per tick. Both go through one mutex that is
/// only held for a map update or a swap, so a drain sees every accumulation
/// made before it and none made after.
pub struct StatsAggregator {
    live: Mutex<LiveCounters>,
    history: Mutex<StatHistory>,
}

struct LiveCounters {
    connections: HashMap<ConnectionKey, Counters>,
    unattributed: Counters,
    since: Instant,
    // Set on close; later accumulations are dropped
    sealed: bool,
    accumulated: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicked capture thread must not take the tick path down with it
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StatsAggregator {
    pub fn new(history_len: usize) -> Self {
        Self {
            live: Mutex::new(LiveCounters {
                connections: HashMap::new(),
                unattributed: Counters::default(),
                since: Instant::now(),
                sealed: false,
                accumulated: 0,
            }),
            history: Mutex::new(StatHistory::new(history_len)),
        }
    }

    pub fn accumulate(&self, key: ConnectionKey, direction: Direction, bytes: u64) {
        let mut live = lock(&self.live);
        if live.sealed {
            return;
        }
        live.connections
            .entry(key)
            .or_default()
            .add(direction, bytes);
        live.accumulated += 1;
    }

    /// Count a frame that could not be tied to a connection. Its direction is
    /// unknown, so it is booked as received.
    pub fn accumulate_unattributed(&self, bytes: u64) {
        let mut live = lock(&self.live);
        if live.sealed {
            return;
        }
        live.unattributed.add(Direction::Received, bytes);
        live.accumulated += 1;
    }

    /// Read and reset everything accumulated since the previous drain
    pub fn drain(&self) -> Utilization {
        let now = Instant::now();
        let mut live = lock(&self.live);
        let connections = mem::take(&mut live.connections);
        let unattributed = mem::take(&mut live.unattributed);
        let interval = now.duration_since(live.since);
        live.since = now;
        drop(live);

        log::debug!(
            "Drained {} connections over {:.2}s",
            connections.len(),
            interval.as_secs_f64()
        );

        Utilization {
            connections,
            unattributed,
            interval,
            drained_at: Local::now(),
        }
    }

    /// Stop accepting accumulations. Called once capture threads are joined.
    pub fn seal(&self) {
        let mut live = lock(&self.live);
        live.sealed = true;
        log::debug!(
            "Aggregator sealed after {} accumulations",
            live.accumulated
        );
    }

    pub fn is_sealed(&self) -> bool {
        lock(&self.live).sealed
    }

    /// Merge one interval's utilization with a socket snapshot.
    ///
    /// Pure: the same inputs always give the same `Stat`. Traffic is matched
    /// to a socket by exact key first, then to an unconnected socket on the
    /// same protocol and local port. When several sockets match, the one
    /// later in `open_sockets` wins. Traffic with no socket is kept and
    /// attributed to `unknown`.
    pub fn build_stat(utilization: Utilization, open_sockets: Vec<SocketEntry>) -> Stat {
        let index = SocketIndex::new(&open_sockets);

        let mut connections: Vec<ConnectionStat> = utilization
            .connections
            .iter()
            .map(|(key, counters)| match index.owner(key) {
                Some(socket) => ConnectionStat {
                    key: *key,
                    pid: socket.pid,
                    process_name: socket.process_name.clone(),
                    counters: *counters,
                },
                None => ConnectionStat {
                    key: *key,
                    pid: None,
                    process_name: UNKNOWN_PROCESS.to_string(),
                    counters: *counters,
                },
            })
            .collect();
        connections.sort_by(|a, b| a.key.cmp(&b.key));

        Stat {
            utilization,
            open_sockets,
            connections,
        }
    }

    /// Push a finished stat into the rolling window
    pub fn record(&self, stat: Arc<Stat>) {
        lock(&self.history).push(stat);
    }

    /// Window contents, oldest first
    pub fn history(&self) -> Vec<Arc<Stat>> {
        lock(&self.history).iter().cloned().collect()
    }

    pub fn connection_rate(&self, key: &ConnectionKey) -> Rate {
        lock(&self.history).connection_rate(key)
    }

    pub fn process_rate(&self, pid: Option<i32>) -> Rate {
        lock(&self.history).process_rate(pid)
    }

    pub fn total_rate(&self) -> Rate {
        lock(&self.history).total_rate()
    }
}

/// Lookup structure over one socket snapshot
struct SocketIndex<'a> {
    exact: HashMap<ConnectionKey, &'a SocketEntry>,
    // (protocol, local port) -> unconnected sockets, in snapshot order
    unconnected: HashMap<(Protocol, u16), Vec<&'a SocketEntry>>,
}

impl<'a> SocketIndex<'a> {
    fn new(sockets: &'a [SocketEntry]) -> Self {
        let mut exact = HashMap::new();
        let mut unconnected: HashMap<(Protocol, u16), Vec<&'a SocketEntry>> = HashMap::new();

        for socket in sockets {
            // Later entries overwrite earlier ones
            exact.insert(socket.key, socket);
            if socket.key.is_unconnected() {
                unconnected
                    .entry((socket.key.protocol, socket.key.local_port))
                    .or_default()
                    .push(socket);
            }
        }

        Self { exact, unconnected }
    }

    fn owner(&self, key: &ConnectionKey) -> Option<&'a SocketEntry> {
        if let Some(socket) = self.exact.get(key) {
            return Some(socket);
        }

        self.unconnected
            .get(&(key.protocol, key.local_port))?
            .iter()
            .rev()
            .find(|s| s.key.local_addr == key.local_addr || s.key.local_addr.is_unspecified())
            .copied()
    }
}

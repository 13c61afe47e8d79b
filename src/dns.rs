// Non-blocking reverse DNS with a bounded, expiring cache

use crate::config::Options;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::mem;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// How often a worker waiting for a query slot re-checks for close
const SLOT_WAIT: Duration = Duration::from_millis(50);

/// What the resolver currently knows about an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hostname {
    /// A query is queued or in flight
    Pending,
    Resolved(String),
    /// Resolution failed, timed out or is disabled
    Unresolved(IpAddr),
}

impl Hostname {
    /// Text for display: the name, or the raw address while unknown
    pub fn display(&self, ip: IpAddr) -> String {
        match self {
            Hostname::Resolved(name) => name.clone(),
            Hostname::Pending => ip.to_string(),
            Hostname::Unresolved(ip) => ip.to_string(),
        }
    }
}

/// A blocking reverse lookup. Runs on resolver worker threads only.
pub trait ReverseLookup: Send + Sync + 'static {
    fn reverse(&self, ip: IpAddr) -> Option<String>;
}

/// Reverse lookup through the system resolver (getnameinfo)
pub struct SystemLookup;

impl ReverseLookup for SystemLookup {
    fn reverse(&self, ip: IpAddr) -> Option<String> {
        match dns_lookup::lookup_addr(&ip) {
            Ok(name) => accept_name(ip, name),
            Err(e) => {
                log::trace!("Reverse lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

/// getnameinfo hands back the numeric form when there is no PTR record
fn accept_name(ip: IpAddr, name: String) -> Option<String> {
    if name.is_empty() || name.parse::<IpAddr>().is_ok_and(|parsed| parsed == ip) {
        None
    } else {
        Some(name)
    }
}

/// Resolver limits, usually taken from [`Options`]
#[derive(Debug, Clone, Copy)]
pub struct ResolverSettings {
    pub capacity: usize,
    pub ttl: Duration,
    pub workers: usize,
    pub timeout: Duration,
    /// Addresses that may wait for a free worker
    pub queue_len: usize,
}

impl From<&Options> for ResolverSettings {
    fn from(options: &Options) -> Self {
        Self {
            capacity: options.dns_cache_capacity,
            ttl: options.dns_ttl(),
            workers: options.dns_workers,
            timeout: options.dns_timeout(),
            queue_len: options.dns_cache_capacity,
        }
    }
}

#[derive(Debug)]
enum EntryState {
    Pending,
    Resolved(String),
    Failed,
}

#[derive(Debug)]
struct CacheEntry {
    state: EntryState,
    fetched_at: Instant,
    last_used: u64,
}

#[derive(Debug)]
struct Cache {
    entries: HashMap<IpAddr, CacheEntry>,
    capacity: usize,
    ttl: Duration,
    // Monotonic use counter driving LRU order
    clock: u64,
}

impl Cache {
    fn insert_pending(&mut self, ip: IpAddr) {
        self.clock += 1;
        self.entries.insert(
            ip,
            CacheEntry {
                state: EntryState::Pending,
                fetched_at: Instant::now(),
                last_used: self.clock,
            },
        );

        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .filter(|(addr, _)| **addr != ip)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(addr, _)| *addr);
            match oldest {
                Some(addr) => {
                    self.entries.remove(&addr);
                    log::trace!("Evicted {} from DNS cache", addr);
                }
                None => break,
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reverse DNS cache fed by a fixed pool of worker threads.
///
/// `lookup` never blocks on the network: the first call for an address
/// queues a query and answers `Pending`; later calls are served from the
/// cache until the entry expires.
pub struct AddressResolver {
    cache: Arc<Mutex<Cache>>,
    sender: Mutex<Option<Sender<IpAddr>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    enabled: bool,
}

impl AddressResolver {
    /// System resolver, or a disabled one when `disable_dns_resolve` is set
    pub fn new(options: &Options) -> Self {
        if options.disable_dns_resolve {
            return Self::disabled();
        }
        Self::with_lookup(Arc::new(SystemLookup), ResolverSettings::from(options))
    }

    pub fn with_lookup(lookup: Arc<dyn ReverseLookup>, settings: ResolverSettings) -> Self {
        let cache = Arc::new(Mutex::new(Cache {
            entries: HashMap::new(),
            capacity: settings.capacity.max(1),
            ttl: settings.ttl,
            clock: 0,
        }));
        let closed = Arc::new(AtomicBool::new(false));
        let (query_tx, query_rx) = crossbeam_channel::bounded::<IpAddr>(settings.queue_len.max(1));

        let slots = Arc::new(QuerySlots::new(settings.workers));

        let mut workers = Vec::with_capacity(settings.workers);
        for i in 0..settings.workers.max(1) {
            let rx = query_rx.clone();
            let cache = Arc::clone(&cache);
            let lookup = Arc::clone(&lookup);
            let closed = Arc::clone(&closed);
            let slots = Arc::clone(&slots);
            let timeout = settings.timeout;
            let spawned = thread::Builder::new()
                .name(format!("sniffer-rdns-{}", i))
                .spawn(move || resolve_worker(rx, cache, lookup, slots, closed, timeout));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => log::warn!("Failed to spawn DNS worker: {}", e),
            }
        }
        log::debug!("Started {} DNS workers", workers.len());

        Self {
            cache,
            sender: Mutex::new(Some(query_tx)),
            workers: Mutex::new(workers),
            closed,
            enabled: true,
        }
    }

    /// A resolver that answers `Unresolved` for everything
    pub fn disabled() -> Self {
        Self {
            cache: Arc::new(Mutex::new(Cache {
                entries: HashMap::new(),
                capacity: 1,
                ttl: Duration::ZERO,
                clock: 0,
            })),
            sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            closed: Arc::new(AtomicBool::new(false)),
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.closed.load(Ordering::Acquire)
    }

    /// Current knowledge about `ip`, queueing a query when there is none or
    /// the cached answer has expired.
    pub fn lookup(&self, ip: IpAddr) -> Hostname {
        if !self.is_enabled() {
            return Hostname::Unresolved(ip);
        }

        let mut cache = lock(&self.cache);
        cache.clock += 1;
        let (clock, ttl) = (cache.clock, cache.ttl);

        let mut stale = None;
        if let Some(entry) = cache.entries.get_mut(&ip) {
            entry.last_used = clock;
            let fresh = entry.fetched_at.elapsed() < ttl;
            match &entry.state {
                EntryState::Pending => return Hostname::Pending,
                EntryState::Resolved(name) if fresh => return Hostname::Resolved(name.clone()),
                EntryState::Failed if fresh => return Hostname::Unresolved(ip),
                EntryState::Resolved(name) => stale = Some(Hostname::Resolved(name.clone())),
                EntryState::Failed => stale = Some(Hostname::Unresolved(ip)),
            }
        }

        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Hostname::Unresolved(ip);
        };
        match sender.try_send(ip) {
            Ok(()) => {
                cache.insert_pending(ip);
                Hostname::Pending
            }
            Err(TrySendError::Full(_)) => {
                log::trace!("DNS queue full, {} will be retried", ip);
                stale.unwrap_or(Hostname::Pending)
            }
            Err(TrySendError::Disconnected(_)) => Hostname::Unresolved(ip),
        }
    }

    /// Cached knowledge about `ip` without queueing or touching LRU order
    pub fn peek(&self, ip: IpAddr) -> Option<Hostname> {
        let cache = lock(&self.cache);
        cache.entries.get(&ip).map(|entry| match &entry.state {
            EntryState::Pending => Hostname::Pending,
            EntryState::Resolved(name) => Hostname::Resolved(name.clone()),
            EntryState::Failed => Hostname::Unresolved(ip),
        })
    }

    pub fn len(&self) -> usize {
        lock(&self.cache).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop queued work, wait for in-flight queries and clear the cache.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Workers see the closed flag, then the disconnected queue
        drop(lock(&self.sender).take());
        let workers = mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if worker.join().is_err() {
                log::error!("DNS worker panicked");
            }
        }

        lock(&self.cache).entries.clear();
        log::debug!("DNS resolver closed");
    }
}

impl Drop for AddressResolver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Caps the number of system lookups running at once. A lookup abandoned
/// after its timeout keeps its slot until the call actually returns.
struct QuerySlots {
    taken: Sender<()>,
    freed: Receiver<()>,
}

/// Held by a query thread for as long as its lookup runs
struct QuerySlot {
    freed: Receiver<()>,
}

impl Drop for QuerySlot {
    fn drop(&mut self) {
        let _ = self.freed.try_recv();
    }
}

impl QuerySlots {
    fn new(limit: usize) -> Self {
        let (taken, freed) = crossbeam_channel::bounded(limit.max(1));
        Self { taken, freed }
    }

    /// Wait for a free slot. `None` once the resolver is closing.
    fn acquire(&self, closed: &AtomicBool) -> Option<QuerySlot> {
        while !closed.load(Ordering::Acquire) {
            match self.taken.send_timeout((), SLOT_WAIT) {
                Ok(()) => {
                    return Some(QuerySlot {
                        freed: self.freed.clone(),
                    });
                }
                Err(SendTimeoutError::Timeout(())) => {}
                Err(SendTimeoutError::Disconnected(())) => return None,
            }
        }
        None
    }
}

fn resolve_worker(
    rx: Receiver<IpAddr>,
    cache: Arc<Mutex<Cache>>,
    lookup: Arc<dyn ReverseLookup>,
    slots: Arc<QuerySlots>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
) {
    while let Ok(ip) = rx.recv() {
        if closed.load(Ordering::Acquire) {
            return;
        }
        let Some(slot) = slots.acquire(&closed) else {
            return;
        };

        let state = match resolve_with_timeout(&lookup, ip, timeout, slot) {
            Some(name) => EntryState::Resolved(name),
            None => EntryState::Failed,
        };

        let mut cache = lock(&cache);
        // Evicted while in flight: leave it out
        if let Some(entry) = cache.entries.get_mut(&ip) {
            if matches!(entry.state, EntryState::Pending) {
                log::trace!("Resolved {} -> {:?}", ip, state);
                entry.state = state;
                entry.fetched_at = Instant::now();
            }
        }
    }
}

/// Run `lookup` on a short-lived thread and wait up to `timeout` for it
fn resolve_with_timeout(
    lookup: &Arc<dyn ReverseLookup>,
    ip: IpAddr,
    timeout: Duration,
    slot: QuerySlot,
) -> Option<String> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let lookup = Arc::clone(lookup);

    let spawned = thread::Builder::new()
        .name("sniffer-rdns-query".into())
        .spawn(move || {
            let _ = tx.send(lookup.reverse(ip));
            drop(slot);
        });
    if let Err(e) = spawned {
        log::warn!("Failed to spawn DNS query thread: {}", e);
        return None;
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(_) => {
            log::debug!("Reverse lookup for {} timed out after {:?}", ip, timeout);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    /// Answers "host-a-b-c-d" after `delay`, or nothing for 10.0.0.0/8
    struct FakeLookup {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl FakeLookup {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Most lookups ever running at the same time
        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    impl ReverseLookup for FakeLookup {
        fn reverse(&self, ip: IpAddr) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            match ip {
                IpAddr::V4(v4) if v4.octets()[0] == 10 => None,
                other => Some(format!("host-{}", other.to_string().replace('.', "-"))),
            }
        }
    }

    fn settings() -> ResolverSettings {
        ResolverSettings {
            capacity: 16,
            ttl: Duration::from_secs(300),
            workers: 2,
            timeout: Duration::from_secs(2),
            queue_len: 16,
        }
    }

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_first_lookup_is_pending_then_resolved() {
        let fake = FakeLookup::new(Duration::from_millis(20));
        let resolver = AddressResolver::with_lookup(fake.clone(), settings());
        let addr = ip(1, 2, 3, 4);

        assert_eq!(resolver.lookup(addr), Hostname::Pending);
        wait_until(|| resolver.peek(addr) != Some(Hostname::Pending));

        assert_eq!(resolver.lookup(addr), Hostname::Resolved("host-1-2-3-4".into()));
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_pending_lookups_are_not_requeued() {
        let fake = FakeLookup::new(Duration::from_millis(300));
        let resolver = AddressResolver::with_lookup(fake.clone(), settings());
        let addr = ip(1, 1, 1, 1);

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        assert_eq!(resolver.lookup(addr), Hostname::Pending);
                    }
                });
            }
        });
        wait_until(|| resolver.peek(addr) != Some(Hostname::Pending));
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_failure_degrades_to_address() {
        let fake = FakeLookup::new(Duration::ZERO);
        let resolver = AddressResolver::with_lookup(fake.clone(), settings());
        let addr = ip(10, 0, 0, 1);

        resolver.lookup(addr);
        wait_until(|| resolver.peek(addr) != Some(Hostname::Pending));
        assert_eq!(resolver.lookup(addr), Hostname::Unresolved(addr));
        assert_eq!(resolver.lookup(addr).display(addr), "10.0.0.1");
        assert_eq!(fake.calls(), 1);
    }

    #[test]
    fn test_expired_entries_are_requeried() {
        let fake = FakeLookup::new(Duration::ZERO);
        let resolver = AddressResolver::with_lookup(
            fake.clone(),
            ResolverSettings {
                ttl: Duration::from_millis(50),
                ..settings()
            },
        );
        let addr = ip(8, 8, 8, 8);

        resolver.lookup(addr);
        wait_until(|| resolver.peek(addr) != Some(Hostname::Pending));
        thread::sleep(Duration::from_millis(80));

        assert_eq!(resolver.lookup(addr), Hostname::Pending);
        wait_until(|| fake.calls() == 2);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let fake = FakeLookup::new(Duration::ZERO);
        let resolver = AddressResolver::with_lookup(
            fake.clone(),
            ResolverSettings {
                capacity: 2,
                ..settings()
            },
        );
        let (a, b, c) = (ip(1, 0, 0, 1), ip(1, 0, 0, 2), ip(1, 0, 0, 3));

        resolver.lookup(a);
        resolver.lookup(b);
        wait_until(|| fake.calls() == 2);
        resolver.lookup(a);
        resolver.lookup(c);

        assert_eq!(resolver.len(), 2);
        assert!(resolver.peek(a).is_some());
        assert!(resolver.peek(b).is_none());
        assert!(resolver.peek(c).is_some());
    }

    #[test]
    fn test_full_queue_creates_no_entry() {
        let fake = FakeLookup::new(Duration::from_millis(300));
        let resolver = AddressResolver::with_lookup(
            fake.clone(),
            ResolverSettings {
                workers: 1,
                queue_len: 1,
                ..settings()
            },
        );
        let (a, b, c) = (ip(1, 0, 0, 1), ip(1, 0, 0, 2), ip(1, 0, 0, 3));

        resolver.lookup(a);
        wait_until(|| fake.calls() == 1);
        assert_eq!(resolver.lookup(b), Hostname::Pending);
        assert_eq!(resolver.lookup(c), Hostname::Pending);

        assert!(resolver.peek(b).is_some());
        assert!(resolver.peek(c).is_none());
    }

    #[test]
    fn test_slow_lookup_times_out() {
        let fake = FakeLookup::new(Duration::from_millis(500));
        let resolver = AddressResolver::with_lookup(
            fake,
            ResolverSettings {
                timeout: Duration::from_millis(20),
                ..settings()
            },
        );
        let addr = ip(9, 9, 9, 9);

        resolver.lookup(addr);
        wait_until(|| resolver.peek(addr) != Some(Hostname::Pending));
        assert_eq!(resolver.lookup(addr), Hostname::Unresolved(addr));
    }

    #[test]
    fn test_abandoned_lookups_hold_their_slot() {
        let fake = FakeLookup::new(Duration::from_millis(150));
        let resolver = AddressResolver::with_lookup(
            fake.clone(),
            ResolverSettings {
                workers: 2,
                timeout: Duration::from_millis(10),
                ..settings()
            },
        );
        let addrs: Vec<IpAddr> = (1..=6).map(|i| ip(1, 0, 0, i)).collect();

        for addr in &addrs {
            assert_eq!(resolver.lookup(*addr), Hostname::Pending);
        }
        wait_until(|| {
            addrs
                .iter()
                .all(|addr| resolver.peek(*addr) == Some(Hostname::Unresolved(*addr)))
        });

        assert_eq!(fake.calls(), 6);
        assert!(fake.peak() <= 2, "{} lookups ran at once", fake.peak());
    }

    #[test]
    fn test_disabled_resolver_never_queries() {
        let options = Options {
            disable_dns_resolve: true,
            ..Default::default()
        };
        let resolver = AddressResolver::new(&options);
        let addr = ip(1, 1, 1, 1);

        assert!(!resolver.is_enabled());
        assert_eq!(resolver.lookup(addr), Hostname::Unresolved(addr));
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let fake = FakeLookup::new(Duration::ZERO);
        let resolver = AddressResolver::with_lookup(fake.clone(), settings());
        let addr = ip(1, 2, 3, 4);
        resolver.lookup(addr);

        resolver.close();
        resolver.close();

        assert!(resolver.is_empty());
        assert_eq!(resolver.lookup(ip(5, 6, 7, 8)), Hostname::Unresolved(ip(5, 6, 7, 8)));
        assert!(fake.calls() <= 1);
    }

    #[test]
    fn test_numeric_answer_is_not_a_name() {
        let addr = ip(192, 0, 2, 1);
        assert_eq!(accept_name(addr, "192.0.2.1".into()), None);
        assert_eq!(accept_name(addr, String::new()), None);
        assert_eq!(
            accept_name(addr, "example.net".into()),
            Some("example.net".into())
        );
    }
}

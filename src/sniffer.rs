// Pipeline driver: owns every component and turns ticks into stats

use crate::aggregator::StatsAggregator;
use crate::backends::socket_mapper::{SocketTableReader, select_socket_mapper};
use crate::capture::PacketCapture;
use crate::config::Options;
use crate::dns::AddressResolver;
use crate::error::SnifferError;
use crate::filter::PacketFilter;
use crate::model::{SocketEntry, Stat};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Stats produced by [`Sniffer::spawn`], one per tick
pub type StatStream = mpsc::Receiver<Arc<Stat>>;

const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Running,
    Paused,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the capture, socket reader, aggregator and resolver, and ties their
/// lifetimes together.
pub struct Sniffer {
    options: Options,
    capture: Mutex<Option<PacketCapture>>,
    local_addresses: HashSet<IpAddr>,
    interfaces: Vec<String>,
    sockets: SocketTableReader,
    aggregator: Arc<StatsAggregator>,
    resolver: Arc<AddressResolver>,
    // Last good snapshot, reused when a tick's snapshot fails. Held for the
    // whole tick, which also keeps ticks from overlapping.
    last_sockets: Mutex<Vec<SocketEntry>>,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl Sniffer {
    /// Build and start the whole pipeline. On error nothing is left running.
    pub fn new(options: Options) -> Result<Self, SnifferError> {
        options.validate()?;
        let filter = PacketFilter::compile(&options.bpf_filter)?;

        let backend = select_socket_mapper(options.socket_mapper.as_deref())?;
        let sockets = SocketTableReader::new(backend, &options.pids);

        // Take a first snapshot before capture starts so early traffic has
        // something to match against
        let initial = match sockets.snapshot(Instant::now() + options.interval()) {
            Ok(entries) => entries,
            Err(e @ SnifferError::PermissionDenied(_)) => return Err(e),
            Err(e) => {
                log::warn!("Initial socket snapshot failed: {}", e);
                Vec::new()
            }
        };

        let aggregator = Arc::new(StatsAggregator::new(options.history_len));
        let mut capture = PacketCapture::open(&options, filter, Arc::clone(&aggregator))?;
        let resolver = Arc::new(AddressResolver::new(&options));
        capture.run()?;

        let local_addresses = capture.local_addresses().clone();
        let interfaces = capture.interface_names();
        log::info!(
            "Sniffer started on {:?} with socket mapper {} ({:?})",
            interfaces,
            sockets.backend_name(),
            sockets.capabilities()
        );

        let mut sniffer = Self::from_parts(options, sockets, aggregator, resolver);
        sniffer.capture = Mutex::new(Some(capture));
        sniffer.local_addresses = local_addresses;
        sniffer.interfaces = interfaces;
        sniffer.last_sockets = Mutex::new(initial);
        Ok(sniffer)
    }

    /// Assemble a driver around existing components, without packet capture.
    /// Traffic reaches it through the aggregator directly.
    pub fn from_parts(
        options: Options,
        sockets: SocketTableReader,
        aggregator: Arc<StatsAggregator>,
        resolver: Arc<AddressResolver>,
    ) -> Self {
        Self {
            options,
            capture: Mutex::new(None),
            local_addresses: HashSet::new(),
            interfaces: Vec::new(),
            sockets,
            aggregator,
            resolver,
            last_sockets: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn aggregator(&self) -> &Arc<StatsAggregator> {
        &self.aggregator
    }

    pub fn resolver(&self) -> &Arc<AddressResolver> {
        &self.resolver
    }

    pub fn socket_mapper_name(&self) -> &'static str {
        self.sockets.backend_name()
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn local_addresses(&self) -> &HashSet<IpAddr> {
        &self.local_addresses
    }

    pub fn state(&self) -> DriverState {
        if self.paused.load(Ordering::Acquire) {
            DriverState::Paused
        } else {
            DriverState::Running
        }
    }

    /// Stop emitting stats. Capture keeps counting; the next tick after
    /// `resume` reports everything seen in between.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        log::info!("Sniffer paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        log::info!("Sniffer resumed");
    }

    pub fn toggle_pause(&self) -> DriverState {
        match self.state() {
            DriverState::Running => self.pause(),
            DriverState::Paused => self.resume(),
        }
        self.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run one tick: snapshot sockets, drain counters, build and record a
    /// stat. Blocking; `None` while paused or after close.
    pub fn refresh(&self) -> Option<Arc<Stat>> {
        if self.is_closed() || self.state() == DriverState::Paused {
            return None;
        }

        let mut last_sockets = lock(&self.last_sockets);
        let deadline = Instant::now() + self.options.interval();
        match self.sockets.snapshot(deadline) {
            Ok(entries) => *last_sockets = entries,
            Err(e) => log::warn!(
                "Socket snapshot failed, reusing previous ({} sockets): {}",
                last_sockets.len(),
                e
            ),
        }

        let utilization = self.aggregator.drain();
        let stat = Arc::new(StatsAggregator::build_stat(
            utilization,
            last_sockets.clone(),
        ));
        drop(last_sockets);

        self.aggregator.record(Arc::clone(&stat));
        log::debug!(
            "Tick: {} connections, {} bytes, {} open sockets",
            stat.connections.len(),
            stat.total().total_bytes(),
            stat.open_sockets.len()
        );
        Some(stat)
    }

    /// Tick at the configured interval on the current tokio runtime. The
    /// stream ends once the sniffer is closed or the receiver is dropped.
    pub fn spawn(self: Arc<Self>) -> StatStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let period = self.options.interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if self.is_closed() || tx.is_closed() {
                    break;
                }

                let sniffer = Arc::clone(&self);
                let stat = match tokio::task::spawn_blocking(move || sniffer.refresh()).await {
                    Ok(stat) => stat,
                    Err(e) => {
                        log::error!("Refresh task failed: {}", e);
                        break;
                    }
                };

                if let Some(stat) = stat {
                    if tx.send(stat).await.is_err() {
                        break;
                    }
                }
            }
            log::debug!("Tick task stopped");
        });

        rx
    }

    /// Tear the pipeline down: stop capture, seal the counters, stop the
    /// resolver, then release the capture handles. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut capture = lock(&self.capture).take();
        if let Some(capture) = capture.as_mut() {
            capture.stop();
        }
        self.aggregator.seal();
        self.resolver.close();
        if let Some(capture) = capture.as_mut() {
            capture.release();
        }
        log::info!("Sniffer closed");
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.close();
    }
}

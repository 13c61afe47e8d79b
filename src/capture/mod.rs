// Live packet capture, one thread per monitored interface

pub mod decode;

use crate::aggregator::StatsAggregator;
use crate::config::Options;
use crate::error::SnifferError;
use crate::filter::PacketFilter;
use decode::{LinkType, decode_frame};
use pnet::datalink::{self, Channel, DataLinkReceiver, NetworkInterface};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

/// How long a blocking read waits before re-checking the stop flag
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const STATS_LOG_EVERY: u64 = 10_000;
/// Outgoing loopback copies still waiting for their incoming twin
const LOOPBACK_PENDING: usize = 32;

/// Interfaces that are up, carry an address and match one of `prefixes`.
/// An empty prefix list selects every such interface.
pub fn select_interfaces(
    interfaces: Vec<NetworkInterface>,
    prefixes: &[String],
) -> Vec<NetworkInterface> {
    interfaces
        .into_iter()
        .filter(|iface| iface.is_up() && !iface.ips.is_empty())
        .filter(|iface| prefixes.is_empty() || prefixes.iter().any(|p| iface.name.starts_with(p)))
        .collect()
}

/// Addresses bound to the given interfaces
pub fn local_addresses(interfaces: &[NetworkInterface]) -> HashSet<IpAddr> {
    interfaces
        .iter()
        .flat_map(|iface| iface.ips.iter().map(|net| net.ip()))
        .map(|ip| ip.to_canonical())
        .collect()
}

fn link_type(iface: &NetworkInterface) -> LinkType {
    if iface.is_loopback() {
        LinkType::Ethernet
    } else if iface.mac.is_none() || iface.is_point_to_point() {
        LinkType::RawIp
    } else {
        LinkType::Ethernet
    }
}

#[cfg(target_os = "linux")]
fn privilege_hint() -> &'static str {
    if nix::unistd::geteuid().is_root() {
        ""
    } else {
        " (run as root or grant CAP_NET_RAW)"
    }
}

#[cfg(not(target_os = "linux"))]
fn privilege_hint() -> &'static str {
    " (run as root)"
}

fn channel_error(iface: &str, err: io::Error) -> SnifferError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        SnifferError::PermissionDenied(format!(
            "cannot capture on {}: {}{}",
            iface,
            err,
            privilege_hint()
        ))
    } else {
        SnifferError::DeviceUnavailable(format!("failed to open {}: {}", iface, err))
    }
}

/// Per-thread frame counters, logged periodically
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub frames: AtomicU64,
    pub filtered: AtomicU64,
    pub undecodable: AtomicU64,
}

/// Turns raw frames into aggregator updates. Shared by every capture thread
/// of one pipeline; the link type is per interface.
pub struct FrameProcessor {
    local: Arc<HashSet<IpAddr>>,
    filter: Arc<PacketFilter>,
    aggregator: Arc<StatsAggregator>,
    count_undecodable: bool,
}

impl FrameProcessor {
    pub fn new(
        local: Arc<HashSet<IpAddr>>,
        filter: Arc<PacketFilter>,
        aggregator: Arc<StatsAggregator>,
        count_undecodable: bool,
    ) -> Self {
        Self {
            local,
            filter,
            aggregator,
            count_undecodable,
        }
    }

    pub fn process(&self, link: LinkType, frame: &[u8], stats: &CaptureStats) {
        stats.frames.fetch_add(1, Ordering::Relaxed);

        let decoded = match decode_frame(link, frame) {
            Ok(decoded) => decoded,
            Err(skip) => {
                stats.undecodable.fetch_add(1, Ordering::Relaxed);
                log::trace!("Skipping frame ({} bytes): {}", frame.len(), skip);
                if self.count_undecodable && self.filter.matches_undecodable(frame.len()) {
                    self.aggregator.accumulate_unattributed(frame.len() as u64);
                }
                return;
            }
        };

        if !self.filter.matches(&decoded) {
            stats.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let (key, direction) = decoded.canonicalize(&self.local);
        self.aggregator
            .accumulate(key, direction, decoded.length as u64);
    }
}

/// Drops the second copy of each loopback frame.
///
/// A Linux packet socket sees every loopback packet twice, once outgoing and
/// once incoming, and pnet does not report which is which. The copies are
/// byte-identical, so a frame equal to a recent unpaired one is its twin.
#[derive(Debug, Default)]
pub struct LoopbackDedup {
    pending: VecDeque<Vec<u8>>,
}

impl LoopbackDedup {
    pub fn is_duplicate(&mut self, frame: &[u8]) -> bool {
        if let Some(pos) = self.pending.iter().position(|seen| seen.as_slice() == frame) {
            self.pending.remove(pos);
            return true;
        }
        if self.pending.len() == LOOPBACK_PENDING {
            self.pending.pop_front();
        }
        self.pending.push_back(frame.to_vec());
        false
    }
}

struct OpenChannel {
    name: String,
    link: LinkType,
    rx: Box<dyn DataLinkReceiver>,
    dedup: Option<LoopbackDedup>,
}

/// Owns the capture handles and the threads reading them.
///
/// Stopping happens in two steps so the caller can order teardown: `stop`
/// joins the threads (no frame is delivered after it returns) but keeps the
/// handles open, `release` closes them.
pub struct PacketCapture {
    idle: Vec<OpenChannel>,
    threads: Vec<thread::JoinHandle<OpenChannel>>,
    running: Arc<AtomicBool>,
    processor: Arc<FrameProcessor>,
    local: Arc<HashSet<IpAddr>>,
}

impl PacketCapture {
    /// Open a capture handle on every matching interface. Nothing is read
    /// until [`run`](Self::run).
    pub fn open(
        options: &Options,
        filter: PacketFilter,
        aggregator: Arc<StatsAggregator>,
    ) -> Result<Self, SnifferError> {
        let interfaces = select_interfaces(datalink::interfaces(), &options.devices_prefix);
        if interfaces.is_empty() {
            return Err(SnifferError::DeviceUnavailable(if options.devices_prefix.is_empty() {
                "no interface is up with an address".to_string()
            } else {
                format!(
                    "no interface is up with an address matching {:?}",
                    options.devices_prefix
                )
            }));
        }

        let local = Arc::new(local_addresses(&interfaces));
        log::debug!("Local addresses: {:?}", local);

        let config = datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            promiscuous: options.promiscuous,
            ..Default::default()
        };

        let mut idle = Vec::with_capacity(interfaces.len());
        for iface in &interfaces {
            log::debug!("Interface details: {:?}", iface);
            let rx = match datalink::channel(iface, config) {
                Ok(Channel::Ethernet(_tx, rx)) => rx,
                Ok(_) => {
                    return Err(SnifferError::DeviceUnavailable(format!(
                        "unsupported channel type for {}",
                        iface.name
                    )));
                }
                Err(e) => return Err(channel_error(&iface.name, e)),
            };
            let link = link_type(iface);
            log::info!("Opened capture on {} ({:?})", iface.name, link);
            let dedup = (cfg!(target_os = "linux") && iface.is_loopback())
                .then(LoopbackDedup::default);
            idle.push(OpenChannel {
                name: iface.name.clone(),
                link,
                rx,
                dedup,
            });
        }

        let processor = Arc::new(FrameProcessor::new(
            Arc::clone(&local),
            Arc::new(filter),
            aggregator,
            options.count_undecodable,
        ));

        Ok(Self {
            idle,
            threads: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            processor,
            local,
        })
    }

    pub fn local_addresses(&self) -> &HashSet<IpAddr> {
        &self.local
    }

    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.idle.iter().map(|c| c.name.clone()).collect();
        names.extend(
            self.threads
                .iter()
                .filter_map(|t| t.thread().name())
                .filter_map(|n| n.strip_prefix("capture-"))
                .map(str::to_string),
        );
        names
    }

    /// Start one reader thread per open handle
    pub fn run(&mut self) -> Result<(), SnifferError> {
        if self.idle.is_empty() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);
        log::info!("Starting packet capture on {} interfaces", self.idle.len());

        for channel in self.idle.drain(..) {
            let running = Arc::clone(&self.running);
            let processor = Arc::clone(&self.processor);
            let handle = thread::Builder::new()
                .name(format!("capture-{}", channel.name))
                .spawn(move || capture_loop(channel, running, processor))?;
            self.threads.push(handle);
        }
        Ok(())
    }

    /// Stop reading and wait for every capture thread to finish. Handles stay
    /// open until [`release`](Self::release).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(channel) => self.idle.push(channel),
                Err(_) => log::error!("Packet capture thread panicked"),
            }
        }
    }

    /// Close every capture handle
    pub fn release(&mut self) {
        for channel in self.idle.drain(..) {
            log::debug!("Closing capture on {}", channel.name);
        }
    }
}

impl Drop for PacketCapture {
    fn drop(&mut self) {
        self.stop();
        self.release();
    }
}

fn capture_loop(
    mut channel: OpenChannel,
    running: Arc<AtomicBool>,
    processor: Arc<FrameProcessor>,
) -> OpenChannel {
    log::info!("Packet capture thread started on interface: {}", channel.name);
    let stats = CaptureStats::default();

    while running.load(Ordering::Acquire) {
        match channel.rx.next() {
            Ok(frame) => {
                if let Some(dedup) = channel.dedup.as_mut() {
                    if dedup.is_duplicate(frame) {
                        continue;
                    }
                }
                processor.process(channel.link, frame, &stats);
                let frames = stats.frames.load(Ordering::Relaxed);
                if frames % STATS_LOG_EVERY == 0 {
                    log::debug!(
                        "Packet stats on {}: frames={}, filtered={}, undecodable={}",
                        channel.name,
                        frames,
                        stats.filtered.load(Ordering::Relaxed),
                        stats.undecodable.load(Ordering::Relaxed)
                    );
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) => {
                log::error!("Packet receive error on {}: {}", channel.name, e);
                thread::sleep(RECEIVE_ERROR_BACKOFF);
            }
        }
    }

    log::info!(
        "Packet capture thread on {} stopped after {} frames",
        channel.name,
        stats.frames.load(Ordering::Relaxed)
    );
    channel
}

//! Per-process network bandwidth monitoring.
//!
//! Packets are captured off the selected interfaces, folded into
//! per-connection counters, and matched once per tick against a snapshot of
//! the open sockets to find the owning process. Remote addresses can be
//! resolved to hostnames in the background for display.

pub mod aggregator;
pub mod backends;
pub mod capture;
pub mod config;
pub mod dns;
pub mod error;
pub mod filter;
pub mod history;
pub mod model;
pub mod sniffer;

pub use aggregator::StatsAggregator;
pub use config::Options;
pub use dns::{AddressResolver, Hostname};
pub use error::SnifferError;
pub use filter::PacketFilter;
pub use model::{ConnectionKey, ConnectionStat, Counters, Direction, Protocol, Stat};
pub use sniffer::{DriverState, Sniffer, StatStream};

// Rolling window of recent stats, used to smooth rates for display

use crate::model::{ConnectionKey, Counters, Stat};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Default number of intervals kept (10 samples = 10 seconds at 1Hz)
pub const DEFAULT_HISTORY_LEN: usize = 10;

/// Average throughput over a window, in bytes per second
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rate {
    pub sent_per_sec: f64,
    pub received_per_sec: f64,
}

impl Rate {
    fn from_totals(counters: &Counters, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Rate::default();
        }
        Rate {
            sent_per_sec: counters.bytes_sent as f64 / secs,
            received_per_sec: counters.bytes_received as f64 / secs,
        }
    }

    pub fn total_per_sec(&self) -> f64 {
        self.sent_per_sec + self.received_per_sec
    }
}

/// Bounded FIFO of the most recent stats. Oldest entries fall off once the
/// window is full.
#[derive(Debug)]
pub struct StatHistory {
    capacity: usize,
    samples: VecDeque<Arc<Stat>>,
}

impl StatHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, stat: Arc<Stat>) {
        self.samples.push_back(stat);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Arc<Stat>> {
        self.samples.back()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Stat>> {
        self.samples.iter()
    }

    fn window_elapsed(&self) -> Duration {
        self.samples.iter().map(|s| s.utilization.interval).sum()
    }

    /// Average rate of one connection across the window. Intervals where it
    /// had no traffic count as zero.
    pub fn connection_rate(&self, key: &ConnectionKey) -> Rate {
        let mut totals = Counters::default();
        for stat in &self.samples {
            if let Some(counters) = stat.utilization.connections.get(key) {
                totals.merge(counters);
            }
        }
        Rate::from_totals(&totals, self.window_elapsed())
    }

    /// Average rate of everything captured, attributed or not
    pub fn total_rate(&self) -> Rate {
        let mut totals = Counters::default();
        for stat in &self.samples {
            totals.merge(&stat.total());
        }
        Rate::from_totals(&totals, self.window_elapsed())
    }

    /// Average rate of one process. `None` selects unattributed traffic.
    pub fn process_rate(&self, pid: Option<i32>) -> Rate {
        let mut totals = Counters::default();
        for stat in &self.samples {
            for conn in stat.connections.iter().filter(|c| c.pid == pid) {
                totals.merge(&conn.counters);
            }
        }
        Rate::from_totals(&totals, self.window_elapsed())
    }
}

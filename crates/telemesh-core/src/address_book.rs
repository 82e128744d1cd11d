//! Path Ranking
//!
//! Per-exchange book of candidate network paths to one peer, ranked by
//! reachability and latency. Handshake round trips feed the latency
//! estimate; a path that misses a whole handshake epoch is demoted.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Maximum tracked paths per peer
pub const MAX_ENTRIES: usize = 16;

/// Paths probed per handshake epoch
pub const HANDSHAKE_FANOUT: usize = 5;

/// Latency samples kept per path
const SAMPLE_COUNT: usize = 16;

/// Latency prior for new paths
const LATENCY_PRIOR: Duration = Duration::from_millis(125);

/// One candidate path
#[derive(Debug, Clone)]
pub struct Entry {
    pub addr: SocketAddr,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_attempt: Instant,
    pub reachable: bool,
    pub got_response: bool,

    latency: Duration,
    samples: [Duration; SAMPLE_COUNT],
    sample_cursor: usize,
}

impl Entry {
    fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            first_seen: now,
            last_seen: now,
            last_attempt: now,
            reachable: true,
            got_response: true,
            latency: LATENCY_PRIOR,
            samples: [LATENCY_PRIOR; SAMPLE_COUNT],
            sample_cursor: 0,
        }
    }

    /// Smoothed round-trip estimate
    pub fn latency(&self) -> Duration {
        self.latency
    }

    fn add_latency_sample(&mut self, sample: Duration) {
        self.samples[self.sample_cursor % SAMPLE_COUNT] = sample;
        self.sample_cursor += 1;

        let total: Duration = self.samples.iter().sum();
        self.latency = total / SAMPLE_COUNT as u32;
    }
}

/// Ranked set of candidate paths to one peer
#[derive(Debug, Default)]
pub struct AddressBook {
    known: Vec<Entry>,
    active: Option<SocketAddr>,
}

impl AddressBook {
    /// Create an empty book
    pub fn new() -> Self {
        Self::default()
    }

    /// The path currently used for channel packets
    pub fn active_address(&self) -> Option<SocketAddr> {
        self.active
    }

    /// All known paths, best first
    pub fn known_addresses(&self) -> Vec<SocketAddr> {
        self.known.iter().map(|e| e.addr).collect()
    }

    /// Look up one entry
    pub fn entry(&self, addr: SocketAddr) -> Option<&Entry> {
        self.known.iter().find(|e| e.addr == addr)
    }

    /// Paths to broadcast the next handshake on
    ///
    /// Walks the ranked list and stops at the first unreachable entry.
    pub fn handshake_addresses(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        for entry in &self.known {
            if out.len() == HANDSHAKE_FANOUT || !entry.reachable {
                break;
            }
            out.push(entry.addr);
        }
        out
    }

    /// Add a candidate path if it is not already known
    pub fn add_address(&mut self, addr: SocketAddr) {
        if self.index_of(addr).is_some() {
            return;
        }

        let entry = Entry::new(addr, Instant::now());
        debug!("Discovered path {} (latency={:?})", addr, entry.latency);
        self.known.push(entry);
        self.update_active();
    }

    /// Record a handshake arriving over the given path
    pub fn received_handshake(&mut self, addr: SocketAddr) {
        let now = Instant::now();

        match self.index_of(addr) {
            Some(idx) => {
                let entry = &mut self.known[idx];
                let sample = now.saturating_duration_since(entry.last_attempt);
                entry.add_latency_sample(sample);
                entry.last_seen = now;
                entry.reachable = true;
                entry.got_response = true;
                debug!("Updated path {} (latency={:?})", addr, entry.latency);
            }
            None => {
                let mut entry = Entry::new(addr, now);
                entry.first_seen = now;
                self.known.push(entry);
                debug!("Discovered path {} via handshake", addr);
            }
        }

        self.update_active();
    }

    /// Record a handshake sent over the given path
    pub fn sent_handshake(&mut self, addr: SocketAddr) {
        if let Some(idx) = self.index_of(addr) {
            self.known[idx].last_attempt = Instant::now();
        }
    }

    /// Start a new handshake epoch
    ///
    /// A path that stayed silent for a whole epoch while marked
    /// reachable is demoted; all response flags reset.
    pub fn next_handshake_epoch(&mut self) {
        let mut changed = false;

        for entry in &mut self.known {
            if !entry.got_response && entry.reachable {
                entry.reachable = false;
                changed = true;
                debug!("Detected broken path {}", entry.addr);
            }
            entry.got_response = false;
        }

        if changed {
            self.update_active();
        }
    }

    /// Number of known paths
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Is the book empty?
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.known.iter().position(|e| e.addr == addr)
    }

    fn update_active(&mut self) {
        self.known.sort_by(|a, b| {
            b.reachable
                .cmp(&a.reachable)
                .then(a.latency.cmp(&b.latency))
        });
        self.known.truncate(MAX_ENTRIES);

        let old = self.active;
        self.active = match self.known.first() {
            Some(entry) if entry.reachable => Some(entry.addr),
            _ => None,
        };

        if old != self.active {
            debug!("Changed path from {:?} to {:?}", old, self.active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> SocketAddr {
        format!("10.0.0.{}:4000", n).parse().unwrap()
    }

    #[test]
    fn test_add_sets_active() {
        let mut book = AddressBook::new();
        assert!(book.active_address().is_none());

        book.add_address(addr(1));
        assert_eq!(book.active_address(), Some(addr(1)));
        assert_eq!(book.known_addresses(), vec![addr(1)]);
    }

    #[test]
    fn test_capped_at_max_entries() {
        let mut book = AddressBook::new();
        for n in 0..30 {
            book.add_address(addr(n));
        }
        assert_eq!(book.len(), MAX_ENTRIES);
    }

    #[test]
    fn test_latency_ranking() {
        let mut book = AddressBook::new();
        book.add_address(addr(1));
        book.add_address(addr(2));

        // Fast responses on path 2 pull its EWMA below the prior
        for _ in 0..SAMPLE_COUNT {
            book.sent_handshake(addr(2));
            book.received_handshake(addr(2));
        }

        assert_eq!(book.active_address(), Some(addr(2)));
        assert_eq!(book.known_addresses()[0], addr(2));
    }

    #[test]
    fn test_epoch_demotes_silent_paths() {
        let mut book = AddressBook::new();
        book.add_address(addr(1));
        book.add_address(addr(2));

        // Epoch 1: only path 2 answers
        book.next_handshake_epoch();
        book.received_handshake(addr(2));

        // Epoch 2: path 1 has been silent a full epoch
        book.next_handshake_epoch();

        assert!(!book.entry(addr(1)).unwrap().reachable);
        assert!(book.entry(addr(2)).unwrap().reachable);
        assert_eq!(book.active_address(), Some(addr(2)));
    }

    #[test]
    fn test_handshake_addresses_stop_at_unreachable() {
        let mut book = AddressBook::new();
        for n in 0..8 {
            book.add_address(addr(n));
        }

        let fanout = book.handshake_addresses();
        assert_eq!(fanout.len(), HANDSHAKE_FANOUT);

        // Break every path; fanout dries up
        book.next_handshake_epoch();
        book.next_handshake_epoch();
        assert!(book.handshake_addresses().is_empty());
        assert!(book.active_address().is_none());
    }

    #[test]
    fn test_sorted_invariant() {
        let mut book = AddressBook::new();
        for n in 0..10 {
            book.add_address(addr(n));
        }
        for _ in 0..4 {
            book.sent_handshake(addr(7));
            book.received_handshake(addr(7));
        }
        book.next_handshake_epoch();
        book.received_handshake(addr(3));
        book.next_handshake_epoch();

        let entries: Vec<_> = book.known_addresses();
        let mut prev_reachable = true;
        for a in entries {
            let entry = book.entry(a).unwrap();
            // Reachable entries sort before unreachable ones
            assert!(prev_reachable || !entry.reachable);
            prev_reachable = entry.reachable;
        }
    }
}

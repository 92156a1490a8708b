//! TCP port pool for web-IDE helper processes.
//!
//! Ports in 8080–9999 are handed out one at a time. A returned port enters a
//! cool-down (default 30 s) before it can be reissued, sidestepping TIME_WAIT
//! collisions. Availability is validated at acquire time with a throwaway
//! bind, so the pool's bookkeeping never substitutes for the kernel's view.
//! When the range is exhausted, acquisition falls back to an offset plus a
//! random probe above the range.

use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

/// First port in the managed range.
pub const RANGE_START: u16 = 8080;
/// Last port in the managed range.
pub const RANGE_END: u16 = 9999;
/// Offset above the range where exhaustion fallback probing starts.
const FALLBACK_OFFSET: u16 = 10_000;
/// Width of the random fallback window.
const FALLBACK_SPAN: u16 = 20_000;
/// Fallback probe attempts before giving up.
const FALLBACK_ATTEMPTS: usize = 32;

struct PoolState {
    in_use: HashSet<u16>,
    cooling: HashMap<u16, Instant>,
}

/// Allocator of helper ports with deferred release.
pub struct PortPool {
    state: Mutex<PoolState>,
    cooldown: Duration,
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl PortPool {
    /// Create a pool with the given cool-down.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(PoolState {
                in_use: HashSet::new(),
                cooling: HashMap::new(),
            }),
            cooldown,
        }
    }

    /// Acquire a free port.
    ///
    /// Scans the managed range for a port that is neither held nor cooling
    /// and that actually binds right now. Falls back to random probing above
    /// the range when the whole range is busy. `None` means nothing bound.
    pub fn acquire(&self) -> Option<u16> {
        let mut state = self.state.lock().expect("port pool lock poisoned");

        // Lazy cool-down expiry: anything past its window becomes free.
        let cooldown = self.cooldown;
        state.cooling.retain(|_, since| since.elapsed() < cooldown);

        for port in RANGE_START..=RANGE_END {
            if state.in_use.contains(&port) || state.cooling.contains_key(&port) {
                continue;
            }
            if bindable(port) {
                state.in_use.insert(port);
                return Some(port);
            }
        }

        // Exhausted: offset + random probe, still validated by binding.
        let mut rng = rand::thread_rng();
        for _ in 0..FALLBACK_ATTEMPTS {
            let port = RANGE_START
                .saturating_add(FALLBACK_OFFSET)
                .saturating_add(rng.gen_range(0..FALLBACK_SPAN));
            if state.in_use.contains(&port) || state.cooling.contains_key(&port) {
                continue;
            }
            if bindable(port) {
                state.in_use.insert(port);
                return Some(port);
            }
        }

        None
    }

    /// Return a port to the pool. It becomes reissuable after the cool-down.
    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().expect("port pool lock poisoned");
        if state.in_use.remove(&port) {
            state.cooling.insert(port, Instant::now());
        }
    }

    /// Ports currently held by sessions.
    pub fn in_use_count(&self) -> usize {
        self.state
            .lock()
            .expect("port pool lock poisoned")
            .in_use
            .len()
    }

    /// Ports waiting out their cool-down.
    pub fn cooling_count(&self) -> usize {
        let state = self.state.lock().expect("port pool lock poisoned");
        let cooldown = self.cooldown;
        state
            .cooling
            .values()
            .filter(|since| since.elapsed() < cooldown)
            .count()
    }
}

/// Can this port be bound on all interfaces right now?
fn bindable(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn acquire_hands_out_range_ports() {
        let pool = PortPool::default();
        let port = pool.acquire().expect("a port should be free");
        assert!((RANGE_START..=RANGE_END).contains(&port));
        pool.release(port);
    }

    #[test]
    fn no_two_holders_share_a_port() {
        let pool = PortPool::default();
        let mut held = HashSet::new();
        let ports: Vec<u16> = (0..10).filter_map(|_| pool.acquire()).collect();
        for port in &ports {
            assert!(held.insert(*port), "port {port} issued twice");
        }
        assert_eq!(pool.in_use_count(), ports.len());
        for port in ports {
            pool.release(port);
        }
    }

    #[test]
    fn released_port_waits_out_cooldown() {
        let pool = PortPool::new(Duration::from_millis(80));
        let first = pool.acquire().unwrap();
        pool.release(first);
        assert_eq!(pool.cooling_count(), 1);

        // Immediately reacquiring must yield a different port.
        let second = pool.acquire().unwrap();
        assert_ne!(first, second);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.cooling_count(), 0);

        // After the cool-down the original port is issuable again.
        let mut seen = HashSet::new();
        loop {
            match pool.acquire() {
                Some(p) if p == first => break,
                Some(p) => {
                    seen.insert(p);
                }
                None => panic!("pool exhausted before reissuing {first}"),
            }
            if seen.len() > 64 {
                panic!("port {first} not reissued after cool-down");
            }
        }
        for p in seen {
            pool.release(p);
        }
        pool.release(second);
        pool.release(first);
    }

    #[test]
    fn release_of_unheld_port_is_ignored() {
        let pool = PortPool::default();
        pool.release(12345);
        assert_eq!(pool.cooling_count(), 0);
    }

    #[test]
    fn acquired_port_really_binds() {
        let pool = PortPool::default();
        let port = pool.acquire().unwrap();
        // The pool validated with a throwaway bind, so binding again now
        // must also work (nothing else holds it).
        let listener = TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok());
        pool.release(port);
    }

    #[test]
    fn concurrent_acquires_are_disjoint() {
        use std::sync::Arc;
        let pool = Arc::new(PortPool::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.acquire())
            })
            .collect();
        let ports: Vec<u16> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<_> = ports.iter().collect();
        assert_eq!(unique.len(), ports.len());
        for port in ports {
            pool.release(port);
        }
    }
}

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Artificial loss and delay applied to outgoing datagrams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Percentage of datagrams dropped, 0 to 100.
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn lossy(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
            ..Default::default()
        }
    }

    pub fn should_drop(&self, rng: &mut XorShift64) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rng.next_f32() * 100.0 < self.loss_percent
    }

    pub fn delay(&self, rng: &mut XorShift64) -> Duration {
        if !self.enabled || (self.max_latency_ms == 0 && self.jitter_ms == 0) {
            return Duration::ZERO;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let jitter = (rng.next_f32() * self.jitter_ms as f32) as u32;
        let ms = base + (rng.next_f32() * range as f32) as u32 + jitter;
        Duration::from_millis(u64::from(ms))
    }
}

/// Small deterministic generator so simulated runs can be replayed from a seed.
#[derive(Debug, Clone)]
pub struct XorShift64(u64);

impl XorShift64 {
    pub fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Seed for session salts and simulators. Two processes can read the same
/// `Instant`, so the process id is mixed in to keep their salts apart.
pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    hasher.finish()
}

#[derive(Debug)]
struct DelayedDatagram {
    release_time: Instant,
    order: u64,
    bytes: Vec<u8>,
    addr: SocketAddr,
}

impl PartialEq for DelayedDatagram {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DelayedDatagram {}

impl PartialOrd for DelayedDatagram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedDatagram {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_time
            .cmp(&self.release_time)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Applies a [`PacketLossSimulation`] to outgoing datagrams.
#[derive(Debug)]
pub struct NetworkSimulator {
    config: PacketLossSimulation,
    rng: XorShift64,
    queue: BinaryHeap<DelayedDatagram>,
    next_order: u64,
}

impl NetworkSimulator {
    pub fn new(config: PacketLossSimulation, seed: u64) -> Self {
        Self {
            config,
            rng: XorShift64::new(seed),
            queue: BinaryHeap::new(),
            next_order: 0,
        }
    }

    pub fn config(&self) -> &PacketLossSimulation {
        &self.config
    }

    pub fn set_config(&mut self, config: PacketLossSimulation) {
        self.config = config;
    }

    /// Returns `false` if the datagram was dropped.
    pub fn enqueue(&mut self, bytes: Vec<u8>, addr: SocketAddr, now: Instant) -> bool {
        if self.config.should_drop(&mut self.rng) {
            return false;
        }

        let delay = self.config.delay(&mut self.rng);
        self.queue.push(DelayedDatagram {
            release_time: now + delay,
            order: self.next_order,
            bytes,
            addr,
        });
        self.next_order += 1;
        true
    }

    pub fn take_ready(&mut self, now: Instant) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut ready = Vec::new();
        while self.queue.peek().is_some_and(|d| d.release_time <= now) {
            if let Some(delayed) = self.queue.pop() {
                ready.push((delayed.bytes, delayed.addr));
            }
        }
        ready
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    #[test]
    fn disabled_simulation_passes_everything() {
        let mut sim = NetworkSimulator::new(PacketLossSimulation::default(), 1);
        let now = Instant::now();
        for i in 0..100u8 {
            assert!(sim.enqueue(vec![i], addr(), now));
        }
        let ready = sim.take_ready(now);
        assert_eq!(ready.len(), 100);
        assert_eq!(ready[0].0, vec![0]);
        assert_eq!(ready[99].0, vec![99]);
    }

    #[test]
    fn loss_rate_is_roughly_honoured() {
        let mut sim = NetworkSimulator::new(PacketLossSimulation::lossy(5.0), 42);
        let now = Instant::now();
        let delivered = (0..10_000)
            .filter(|_| sim.enqueue(Vec::new(), addr(), now))
            .count();

        assert!((9300..=9700).contains(&delivered), "delivered {delivered}");
    }

    #[test]
    fn delayed_datagrams_wait_for_release() {
        let config = PacketLossSimulation {
            enabled: true,
            min_latency_ms: 20,
            max_latency_ms: 20,
            ..Default::default()
        };
        let mut sim = NetworkSimulator::new(config, 7);
        let now = Instant::now();
        sim.enqueue(vec![1], addr(), now);

        assert!(sim.take_ready(now).is_empty());
        assert_eq!(sim.pending(), 1);
        assert_eq!(sim.take_ready(now + Duration::from_millis(20)).len(), 1);
    }

    #[test]
    fn rng_is_reproducible() {
        let mut a = XorShift64::new(99);
        let mut b = XorShift64::new(99);
        for _ in 0..10 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let f = a.next_f32();
        assert!((0.0..1.0).contains(&f));
    }
}

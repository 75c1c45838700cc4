use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::protocol::sequence_greater_than;

const MAX_RTO: Duration = Duration::from_secs(2);
/// Out-of-order frames held per channel. Frames past this are neither kept
/// nor acknowledged, so the sender repeats them.
pub const MAX_BUFFERED: usize = 1024;
/// Unacknowledged frames per channel before the peer is considered stuck.
pub const MAX_IN_FLIGHT: usize = 4096;

/// Smoothed round-trip estimate (RFC 6298 weights).
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f32,
    rtt_var: f32,
    samples: u32,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            srtt: 100.0,
            rtt_var: 50.0,
            samples: 0,
        }
    }

    pub fn update(&mut self, rtt: Duration) {
        const ALPHA: f32 = 0.125;
        const BETA: f32 = 0.25;

        let rtt = rtt.as_secs_f32() * 1000.0;
        if self.samples == 0 {
            self.srtt = rtt;
            self.rtt_var = rtt / 2.0;
        } else {
            let diff = (rtt - self.srtt).abs();
            self.rtt_var = (1.0 - BETA) * self.rtt_var + BETA * diff;
            self.srtt = (1.0 - ALPHA) * self.srtt + ALPHA * rtt;
        }
        self.samples += 1;
    }

    pub fn srtt_ms(&self) -> f32 {
        self.srtt
    }

    pub fn rtt_var_ms(&self) -> f32 {
        self.rtt_var
    }

    pub fn has_samples(&self) -> bool {
        self.samples > 0
    }

    pub fn srtt(&self) -> Duration {
        Duration::from_secs_f32(self.srtt.max(0.0) / 1000.0)
    }

    /// Retransmission timeout, never below `floor` and never above two seconds.
    pub fn rto(&self, floor: Duration) -> Duration {
        let rto = Duration::from_secs_f32((self.srtt + 4.0 * self.rtt_var).max(0.0) / 1000.0);
        rto.clamp(floor, MAX_RTO.max(floor))
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    sequence: u32,
    frame: Vec<u8>,
    sent_at: Instant,
    resent: bool,
}

/// Sending half of one reliable channel.
#[derive(Debug, Default)]
pub struct ReliableSender {
    next_sequence: u32,
    in_flight: VecDeque<InFlight>,
}

impl ReliableSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns the next sequence and keeps the frame until it is acknowledged.
    /// Returns `None` once [`MAX_IN_FLIGHT`] frames are waiting.
    pub fn push(&mut self, frame: Vec<u8>, now: Instant) -> Option<u32> {
        if self.in_flight.len() >= MAX_IN_FLIGHT {
            return None;
        }
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.in_flight.push_back(InFlight {
            sequence,
            frame,
            sent_at: now,
            resent: false,
        });
        Some(sequence)
    }

    /// Returns a round-trip sample unless the frame had been resent.
    pub fn acknowledge(&mut self, sequence: u32, now: Instant) -> Option<Duration> {
        let index = self.in_flight.iter().position(|f| f.sequence == sequence)?;
        let acked = self.in_flight.remove(index)?;
        if acked.resent {
            None
        } else {
            Some(now.duration_since(acked.sent_at))
        }
    }

    /// Frames unacknowledged for at least `rto`, restamped as sent at `now`.
    pub fn due_for_resend(&mut self, now: Instant, rto: Duration) -> Vec<(u32, Vec<u8>)> {
        self.in_flight
            .iter_mut()
            .filter(|f| now.duration_since(f.sent_at) >= rto)
            .map(|f| {
                f.sent_at = now;
                f.resent = true;
                (f.sequence, f.frame.clone())
            })
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Receiving half of one reliable channel: in-order, at-most-once.
#[derive(Debug, Default)]
pub struct ReliableReceiver {
    next_expected: u32,
    buffered: HashMap<u32, Vec<u8>>,
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the frames that became deliverable, in sequence order, or
    /// `None` when the frame could not be held and must not be acknowledged.
    /// Duplicates are accepted and yield nothing.
    pub fn receive(&mut self, sequence: u32, frame: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        if sequence != self.next_expected {
            if !sequence_greater_than(sequence, self.next_expected)
                || self.buffered.contains_key(&sequence)
            {
                return Some(Vec::new());
            }
            if self.buffered.len() >= MAX_BUFFERED {
                return None;
            }
            self.buffered.insert(sequence, frame);
            return Some(Vec::new());
        }

        let mut ready = vec![frame];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(next) = self.buffered.remove(&self.next_expected) {
            ready.push(next);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        Some(ready)
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }
}

/// Reliable state for every channel of one peer.
#[derive(Debug, Default)]
pub struct PeerChannels {
    senders: HashMap<i32, ReliableSender>,
    receivers: HashMap<i32, ReliableReceiver>,
    rtt: RttEstimator,
}

impl PeerChannels {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the channel already has [`MAX_IN_FLIGHT`] frames outstanding.
    pub fn queue(&mut self, channel: i32, frame: Vec<u8>, now: Instant) -> Option<u32> {
        self.senders.entry(channel).or_default().push(frame, now)
    }

    pub fn on_ack(&mut self, channel: i32, sequence: u32, now: Instant) {
        let sample = self
            .senders
            .get_mut(&channel)
            .and_then(|sender| sender.acknowledge(sequence, now));
        if let Some(rtt) = sample {
            self.rtt.update(rtt);
        }
    }

    /// See [`ReliableReceiver::receive`]. Only acknowledge when this is `Some`.
    pub fn on_payload(
        &mut self,
        channel: i32,
        sequence: u32,
        frame: Vec<u8>,
    ) -> Option<Vec<Vec<u8>>> {
        self.receivers
            .entry(channel)
            .or_default()
            .receive(sequence, frame)
    }

    pub fn resends(&mut self, now: Instant, floor: Duration) -> Vec<(i32, u32, Vec<u8>)> {
        let rto = self.rtt.rto(floor);
        let mut due = Vec::new();
        for (&channel, sender) in self.senders.iter_mut() {
            due.extend(
                sender
                    .due_for_resend(now, rto)
                    .into_iter()
                    .map(|(sequence, frame)| (channel, sequence, frame)),
            );
        }
        due
    }

    pub fn in_flight(&self) -> usize {
        self.senders.values().map(ReliableSender::in_flight).sum()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn latency(&self) -> Option<Duration> {
        self.rtt.has_samples().then(|| self.rtt.srtt())
    }
}

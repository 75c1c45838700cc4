use std::collections::VecDeque;
use std::time::Duration;

use crate::config::HeartbeatConfig;
use crate::error::ProtocolError;
use crate::message::{NetworkShareable, Reader, Writer};

const PING_LEN: usize = 16;
const PONG_LEN: usize = 8;

/// Heartbeat payload. Pings and pongs share one message type and are told
/// apart by length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPacket {
    /// `sent_at` is the sender's heartbeat clock in microseconds.
    Ping { sequence: i64, sent_at: i64 },
    Pong { sequence: i64 },
}

impl HeartbeatPacket {
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        match payload.len() {
            PING_LEN => Ok(Self::Ping {
                sequence: reader.read_i64()?,
                sent_at: reader.read_i64()?,
            }),
            PONG_LEN => Ok(Self::Pong {
                sequence: reader.read_i64()?,
            }),
            len => Err(ProtocolError::MalformedHeartbeat { len }),
        }
    }
}

impl NetworkShareable for HeartbeatPacket {
    fn serialize(&self, writer: &mut Writer) {
        match *self {
            Self::Ping { sequence, sent_at } => {
                writer.write_i64(sequence).write_i64(sent_at);
            }
            Self::Pong { sequence } => {
                writer.write_i64(sequence);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatState {
    #[default]
    Idle,
    AwaitingPong,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    SendPing(HeartbeatPacket),
    /// The miss threshold was reached. Raised once until a pong arrives.
    Unhealthy { missed: u32 },
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    sequence: i64,
    sent_at: Duration,
}

/// Ping scheduling and miss accounting for one connection.
///
/// The clock only moves through [`advance`](Self::advance), so the tracker
/// runs on scheduler time rather than wall time.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    ping_interval: Duration,
    ping_timeout: Duration,
    miss_threshold: u32,
    clock: Duration,
    next_ping_at: Duration,
    next_sequence: i64,
    pending: VecDeque<PendingPing>,
    missed: u32,
    state: HeartbeatState,
    latency: Option<Duration>,
}

impl HeartbeatTracker {
    pub fn new(ping_interval: Duration, ping_timeout: Duration, miss_threshold: u32) -> Self {
        Self {
            ping_interval,
            ping_timeout,
            miss_threshold: miss_threshold.max(1),
            clock: Duration::ZERO,
            next_ping_at: ping_interval,
            next_sequence: 0,
            pending: VecDeque::new(),
            missed: 0,
            state: HeartbeatState::Idle,
            latency: None,
        }
    }

    pub fn from_config(config: &HeartbeatConfig) -> Self {
        Self::new(
            config.ping_interval(),
            config.ping_timeout(),
            config.miss_threshold,
        )
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Round trip of the most recently answered ping.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.ping_interval, self.ping_timeout, self.miss_threshold);
    }

    pub fn advance(&mut self, dt: Duration) -> Vec<HeartbeatEvent> {
        self.clock += dt;
        let mut events = Vec::new();

        let before = self.missed;
        while self
            .pending
            .front()
            .is_some_and(|ping| self.clock - ping.sent_at > self.ping_timeout)
        {
            self.pending.pop_front();
            self.missed += 1;
        }
        if self.missed > before {
            log::debug!("Heartbeat missed {} consecutive pings", self.missed);
            if self.missed >= self.miss_threshold && self.state != HeartbeatState::Unhealthy {
                self.state = HeartbeatState::Unhealthy;
                events.push(HeartbeatEvent::Unhealthy {
                    missed: self.missed,
                });
            }
        }

        if self.clock >= self.next_ping_at {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.pending.push_back(PendingPing {
                sequence,
                sent_at: self.clock,
            });
            self.next_ping_at += self.ping_interval;
            if self.next_ping_at <= self.clock {
                self.next_ping_at = self.clock + self.ping_interval;
            }
            if self.state == HeartbeatState::Idle {
                self.state = HeartbeatState::AwaitingPong;
            }
            events.push(HeartbeatEvent::SendPing(HeartbeatPacket::Ping {
                sequence,
                sent_at: self.clock.as_micros() as i64,
            }));
        }

        if self.pending.is_empty() && self.state == HeartbeatState::AwaitingPong {
            self.state = HeartbeatState::Idle;
        }
        events
    }

    /// Returns the measured round trip, or `None` for an unknown or expired ping.
    pub fn on_pong(&mut self, sequence: i64) -> Option<Duration> {
        let index = self.pending.iter().position(|p| p.sequence == sequence)?;
        let ping = self.pending.remove(index)?;
        // Older pings are as good as lost once a newer one is answered.
        self.pending.retain(|p| p.sequence > sequence);

        let latency = self.clock - ping.sent_at;
        self.latency = Some(latency);
        self.missed = 0;
        self.state = if self.pending.is_empty() {
            HeartbeatState::Idle
        } else {
            HeartbeatState::AwaitingPong
        };
        Some(latency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn tracker() -> HeartbeatTracker {
        HeartbeatTracker::new(100 * MS, 50 * MS, 3)
    }

    fn pings(events: &[HeartbeatEvent]) -> Vec<i64> {
        events
            .iter()
            .filter_map(|e| match e {
                HeartbeatEvent::SendPing(HeartbeatPacket::Ping { sequence, .. }) => Some(*sequence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn packets_are_told_apart_by_length() {
        let mut writer = Writer::new();
        HeartbeatPacket::Ping {
            sequence: 7,
            sent_at: 1_500,
        }
        .serialize(&mut writer);
        assert_eq!(
            HeartbeatPacket::parse(writer.as_bytes()),
            Ok(HeartbeatPacket::Ping {
                sequence: 7,
                sent_at: 1_500
            })
        );

        let mut writer = Writer::new();
        HeartbeatPacket::Pong { sequence: 7 }.serialize(&mut writer);
        assert_eq!(writer.len(), PONG_LEN);

        assert_eq!(
            HeartbeatPacket::parse(&[0; 3]),
            Err(ProtocolError::MalformedHeartbeat { len: 3 })
        );
    }

    #[test]
    fn pings_follow_the_interval() {
        let mut tracker = tracker();
        let mut sent = Vec::new();
        for _ in 0..30 {
            let events = tracker.advance(10 * MS);
            sent.extend(pings(&events));
            if let Some(&sequence) = sent.last() {
                tracker.on_pong(sequence);
            }
        }
        assert_eq!(sent, vec![0, 1, 2]);
        assert_eq!(tracker.state(), HeartbeatState::Idle);
    }

    #[test]
    fn pong_measures_latency_and_resets_misses() {
        let mut tracker = tracker();
        tracker.advance(100 * MS);
        assert_eq!(tracker.state(), HeartbeatState::AwaitingPong);

        tracker.advance(20 * MS);
        assert_eq!(tracker.on_pong(0), Some(20 * MS));
        assert_eq!(tracker.latency(), Some(20 * MS));
        assert_eq!(tracker.missed(), 0);
        assert_eq!(tracker.state(), HeartbeatState::Idle);
        assert_eq!(tracker.on_pong(0), None);
    }

    #[test]
    fn unhealthy_after_exactly_the_threshold() {
        let mut tracker = tracker();
        let mut unhealthy_at = Vec::new();
        let mut answered_first = false;

        for step in 1..=100u32 {
            let events = tracker.advance(10 * MS);
            if !answered_first && !pings(&events).is_empty() {
                tracker.on_pong(0);
                answered_first = true;
            }
            for event in events {
                if let HeartbeatEvent::Unhealthy { missed } = event {
                    unhealthy_at.push((step * 10, missed));
                }
            }
        }

        // Pings at 200, 300 and 400 ms expire 50 ms later.
        assert_eq!(unhealthy_at, vec![(460, 3)]);
        assert_eq!(tracker.state(), HeartbeatState::Unhealthy);
    }

    #[test]
    fn late_pong_is_ignored() {
        let mut tracker = tracker();
        tracker.advance(100 * MS);
        tracker.advance(60 * MS);
        assert_eq!(tracker.missed(), 1);
        assert_eq!(tracker.on_pong(0), None);
        assert_eq!(tracker.missed(), 1);
    }

    #[test]
    fn reset_restarts_the_clock() {
        let mut tracker = tracker();
        tracker.advance(170 * MS);
        tracker.reset();
        assert_eq!(tracker.pending(), 0);
        assert!(pings(&tracker.advance(90 * MS)).is_empty());
        assert_eq!(pings(&tracker.advance(10 * MS)), vec![0]);
    }
}

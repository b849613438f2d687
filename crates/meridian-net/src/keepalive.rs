//! Keepalive bookkeeping and round-trip-time tracking.
//!
//! The tracker is polled once per transport loop iteration. It decides when
//! to send the next ping and when the peer has been silent long enough to
//! declare the link dead. Any inbound message counts as proof of life; a
//! pong additionally yields an RTT sample.
//!
//! Time is [`tokio::time::Instant`] so paused-clock tests drive it.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Configuration for the keepalive tracker.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Interval between pings. Default: 3 s.
    pub ping_interval: Duration,
    /// Silence after which the connection is dead. Default: 60 s.
    pub disconnect_timeout: Duration,
    /// Number of RTT samples kept in the rolling window. Default: 32.
    pub rtt_window: usize,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(3_000),
            disconnect_timeout: Duration::from_secs(60),
            rtt_window: 32,
        }
    }
}

/// What the transport loop should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
    /// Nothing due.
    Idle,
    /// Send a ping now.
    SendPing,
    /// The peer has been silent past the timeout.
    TimedOut,
}

/// Tracks ping cadence, liveness, and RTT.
pub struct KeepaliveTracker {
    config: KeepaliveConfig,
    last_ping: Option<Instant>,
    last_pong: Instant,
    /// Send time of the ping awaiting a pong, if any.
    outstanding: Option<Instant>,
    rtt_samples: VecDeque<Duration>,
    pings_sent: u64,
    pongs_received: u64,
}

impl KeepaliveTracker {
    /// Create a tracker for a connection established at `now`.
    pub fn new(config: KeepaliveConfig, now: Instant) -> Self {
        Self {
            rtt_samples: VecDeque::with_capacity(config.rtt_window),
            config,
            last_ping: None,
            last_pong: now,
            outstanding: None,
            pings_sent: 0,
            pongs_received: 0,
        }
    }

    /// Decide what is due at `now`. Returns [`KeepaliveAction::SendPing`] at
    /// most once per interval and records the ping as sent.
    pub fn poll(&mut self, now: Instant) -> KeepaliveAction {
        if now.saturating_duration_since(self.last_pong) > self.config.disconnect_timeout {
            return KeepaliveAction::TimedOut;
        }

        let due = match self.last_ping {
            None => true,
            Some(at) => now.saturating_duration_since(at) > self.config.ping_interval,
        };
        if !due {
            return KeepaliveAction::Idle;
        }

        self.last_ping = Some(now);
        self.pings_sent += 1;
        if self.outstanding.is_none() {
            self.outstanding = Some(now);
        }
        KeepaliveAction::SendPing
    }

    /// Any inbound message proves the peer is alive.
    pub fn on_inbound(&mut self, now: Instant) {
        self.last_pong = now;
    }

    /// A pong arrived; record liveness and an RTT sample.
    pub fn on_pong(&mut self, now: Instant) {
        self.on_inbound(now);
        self.pongs_received += 1;
        if let Some(sent_at) = self.outstanding.take() {
            if self.rtt_samples.len() >= self.config.rtt_window {
                self.rtt_samples.pop_front();
            }
            self.rtt_samples
                .push_back(now.saturating_duration_since(sent_at));
        }
    }

    /// Time since the peer was last heard from.
    pub fn silence(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_pong)
    }

    /// Average RTT over the rolling window.
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtt_samples.is_empty() {
            return None;
        }
        let sum: Duration = self.rtt_samples.iter().sum();
        Some(sum / self.rtt_samples.len() as u32)
    }

    /// Produce an immutable snapshot of the tracker.
    pub fn snapshot(&self, now: Instant) -> KeepaliveSnapshot {
        KeepaliveSnapshot {
            average_rtt: self.average_rtt(),
            min_rtt: self.rtt_samples.iter().min().copied(),
            max_rtt: self.rtt_samples.iter().max().copied(),
            silence: self.silence(now),
            pings_sent: self.pings_sent,
            pongs_received: self.pongs_received,
        }
    }
}

/// Point-in-time keepalive figures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeepaliveSnapshot {
    pub average_rtt: Option<Duration>,
    pub min_rtt: Option<Duration>,
    pub max_rtt: Option<Duration>,
    /// Time since anything was received.
    pub silence: Duration,
    pub pings_sent: u64,
    pub pongs_received: u64,
}

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ProtocolConfig;

/// Round-trip measurement and failure detection for one session, fed by the
///  ping/pong control traffic.
///
/// History is bounded two ways: at most `ping_history_threshold` completed
///  samples are kept (newest evicts oldest), and samples older than
///  `ping_hold_period` are evicted regardless.
pub struct LivenessMonitor {
    config: Arc<ProtocolConfig>,
    /// completed samples, oldest first: (pong arrival, round trip)
    samples: VecDeque<(Instant, Duration)>,
    /// pings waiting for their pong: id -> sent_at
    outstanding: FxHashMap<u64, Instant>,
    consecutive_failures: u32,
    last_ping_sent: Option<Instant>,
    last_pong: Option<Instant>,
}

impl LivenessMonitor {
    pub fn new(config: Arc<ProtocolConfig>) -> LivenessMonitor {
        LivenessMonitor {
            config,
            samples: VecDeque::new(),
            outstanding: FxHashMap::default(),
            consecutive_failures: 0,
            last_ping_sent: None,
            last_pong: None,
        }
    }

    /// moves pings unanswered past `connection_timeout` into the failure count
    fn sweep_expired(&mut self, now: Instant) {
        let timeout = self.config.connection_timeout;
        let expired = self
            .outstanding
            .iter()
            .filter(|(_, &sent_at)| now.duration_since(sent_at) >= timeout)
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in expired {
            self.outstanding.remove(&id);
            self.consecutive_failures += 1;
            debug!(
                ping_id = id,
                consecutive_failures = self.consecutive_failures,
                "ping expired unanswered"
            );
        }
    }

    fn prune_old_samples(&mut self, now: Instant) {
        let hold = self.config.ping_hold_period;
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > hold {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn on_ping_sent(&mut self, id: u64, now: Instant) {
        self.sweep_expired(now);
        self.outstanding.insert(id, now);
        self.last_ping_sent = Some(now);
    }

    /// Records a pong. Returns the completed round trip, or `None` for a pong
    ///  that matches no outstanding ping (late, or never ours). Either way the
    ///  peer evidently answered, so the failure count resets.
    pub fn on_pong(&mut self, id: u64, now: Instant) -> Option<Duration> {
        self.consecutive_failures = 0;
        self.last_pong = Some(now);

        let sent_at = match self.outstanding.remove(&id) {
            Some(at) => at,
            None => {
                trace!(ping_id = id, "pong for unknown ping");
                return None;
            }
        };
        let round_trip = now.duration_since(sent_at);

        self.samples.push_back((now, round_trip));
        while self.samples.len() > self.config.ping_history_threshold {
            self.samples.pop_front();
        }
        self.prune_old_samples(now);
        trace!(ping_id = id, ?round_trip, "round trip sample");
        Some(round_trip)
    }

    /// Mean of the retained samples, or the configured default while there is
    ///  no usable history.
    pub fn average_round_trip(&mut self, now: Instant) -> Duration {
        self.prune_old_samples(now);
        if self.samples.is_empty() {
            return self.config.default_round_trip;
        }
        let sum = self.samples.iter().map(|&(_, rt)| rt).sum::<Duration>();
        sum / self.samples.len() as u32
    }

    /// True at `max_missing_pings` consecutive failures unconditionally; from
    ///  `min_missing_pings` on, additionally requires the last pong to be
    ///  stale (older than `connection_timeout`, or never seen).
    pub fn is_timed_out(&mut self, now: Instant) -> bool {
        self.sweep_expired(now);

        if self.consecutive_failures >= self.config.max_missing_pings {
            return true;
        }
        if self.consecutive_failures >= self.config.min_missing_pings {
            return match self.last_pong {
                None => true,
                Some(at) => now.duration_since(at) > self.config.connection_timeout,
            };
        }
        false
    }

    /// when the next ping should go out - immediately if none was ever sent
    pub fn next_ping_due(&self, now: Instant) -> Instant {
        match self.last_ping_sent {
            Some(at) => at + self.config.ping_interval,
            None => now,
        }
    }

    pub fn is_ping_due(&self, now: Instant) -> bool {
        self.next_ping_due(now) <= now
    }
}

use std::time::Duration;

use anyhow::bail;

use crate::wire::Block;

/// Tuning knobs for the protocol engine. Plain data - construct with
///  [ProtocolConfig::new], adjust fields, then pass to the connection. The
///  connection calls [ProtocolConfig::validate] on startup.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Negotiated in the handshake: a peer announcing a different version is
    ///  answered with `Busy` and the session is closed.
    pub protocol_version: u64,

    /// The biggest encoded block the engine will hand to the transport. Message
    ///  payloads are fragmented so that each `MessageData` block fits.
    ///
    /// The transport may impose its own ceiling; the effective limit is the
    ///  smaller of the two.
    pub max_block_size: usize,

    /// Hard upper bound on the payload size of a single message.
    pub max_message_size: usize,

    /// A sent fragment is retransmitted when it has been unacknowledged for
    ///  `send_retry_factor` times the measured average round trip, but never
    ///  sooner than `min_retry_after`.
    pub send_retry_factor: u32,
    pub min_retry_after: Duration,

    /// A fragment resent more than this many times fails its whole message.
    pub max_fragment_retries: u32,

    /// Interval between liveness pings on an open session.
    pub ping_interval: Duration,

    /// A ping unanswered for this long counts as a missed ping; it is also the
    ///  staleness bound on the last successful sample in the timeout decision.
    pub connection_timeout: Duration,

    /// At most this many completed round-trip samples are kept for averaging.
    pub ping_history_threshold: usize,

    /// Samples older than this are evicted from the round-trip history.
    pub ping_hold_period: Duration,

    /// `min_missing_pings` consecutive missed pings mark the session as timed
    ///  out if the last successful sample is also stale; `max_missing_pings`
    ///  missed pings mark it timed out unconditionally.
    pub min_missing_pings: u32,
    pub max_missing_pings: u32,

    /// Assumed round trip while there is no measurement history yet. Should be
    ///  pessimistic: too small causes spurious retransmissions on fresh sessions.
    pub default_round_trip: Duration,
}

impl ProtocolConfig {
    pub fn new(protocol_version: u64) -> ProtocolConfig {
        ProtocolConfig {
            protocol_version,
            max_block_size: 1024,
            max_message_size: 16*1024*1024,
            send_retry_factor: 4,
            min_retry_after: Duration::from_millis(20),
            max_fragment_retries: 10,
            ping_interval: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(5),
            ping_history_threshold: 64,
            ping_hold_period: Duration::from_secs(60),
            min_missing_pings: 3,
            max_missing_pings: 10,
            default_round_trip: Duration::from_millis(200),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_block_size <= Block::MESSAGE_DATA_HEADER_SIZE {
            bail!("max_block_size leaves no room for fragment payload");
        }
        if self.max_message_size == 0 {
            bail!("max_message_size must be positive");
        }
        if self.send_retry_factor == 0 {
            bail!("send_retry_factor must be positive");
        }
        if self.ping_history_threshold == 0 {
            bail!("ping_history_threshold must be positive");
        }
        if self.min_missing_pings == 0 || self.min_missing_pings > self.max_missing_pings {
            bail!("missing-ping bounds must satisfy 0 < min <= max");
        }
        if self.default_round_trip.is_zero() {
            bail!("default_round_trip must be positive");
        }
        Ok(())
    }

    /// The payload budget of one `MessageData` fragment.
    pub fn max_fragment_data(&self) -> usize {
        self.max_block_size - Block::MESSAGE_DATA_HEADER_SIZE
    }
}

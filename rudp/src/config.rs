//! Tunable protocol parameters.
//!
//! Window size, retransmission interval and retry budget are configuration,
//! not constants baked into the state machine.  Every endpoint opened by a
//! [`crate::dispatcher::Dispatcher`] shares the dispatcher's [`RudpConfig`].

use std::time::Duration;

use thiserror::Error;

use crate::packet::{HEADER_LEN, MAX_SEGMENT_SIZE};

/// Largest UDP payload deliverable over IPv4.
const MAX_UDP_PAYLOAD: usize = 65_507;

/// Adjustable protocol parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RudpConfig {
    /// Maximum payload bytes per DATA segment.
    pub max_segment_size: usize,
    /// Maximum number of unacknowledged segments in flight per connection.
    pub window_size: usize,
    /// Delay between a transmission and its retransmission.
    pub retransmit_interval: Duration,
    /// Retransmissions allowed per segment before the connection times out.
    pub max_retries: u32,
    /// How long a close waits for in-flight data before sending FIN anyway.
    pub drain_timeout: Duration,
    /// How long a connection stays in `FIN_RECEIVED` re-acknowledging
    /// retransmitted FINs.
    pub linger_timeout: Duration,
}

impl Default for RudpConfig {
    fn default() -> Self {
        Self {
            max_segment_size: MAX_SEGMENT_SIZE,
            window_size: 3,
            retransmit_interval: Duration::from_millis(2000),
            max_retries: 5,
            drain_timeout: Duration::from_secs(10),
            linger_timeout: Duration::from_secs(4),
        }
    }
}

impl RudpConfig {
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_max_segment_size(mut self, max_segment_size: usize) -> Self {
        self.max_segment_size = max_segment_size;
        self
    }

    pub fn with_retransmit_interval(mut self, interval: Duration) -> Self {
        self.retransmit_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_linger_timeout(mut self, timeout: Duration) -> Self {
        self.linger_timeout = timeout;
        self
    }

    /// Worst-case time a segment can stay unacknowledged before its
    /// connection is declared timed out.
    ///
    /// `max_retries` counts retransmissions, not transmissions: the segment
    /// is sent once, re-sent `max_retries` times, and the connection gives up
    /// one interval after the last re-send.  A budget described as
    /// "`max_retries` × retransmission interval" is therefore read as the
    /// time spent retransmitting, and the first interval comes on top:
    /// `(max_retries + 1) × retransmit_interval`.
    pub fn give_up_after(&self) -> Duration {
        self.retransmit_interval * (self.max_retries + 1)
    }

    /// How long a closer whose FIN was acknowledged waits for the peer's FIN.
    ///
    /// The peer may spend up to `drain_timeout` delivering its own data and
    /// then retries its FIN for up to [`RudpConfig::give_up_after`].
    pub fn fin_wait_timeout(&self) -> Duration {
        self.drain_timeout + self.give_up_after()
    }

    /// Check the parameters for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.max_segment_size == 0 || self.max_segment_size > MAX_UDP_PAYLOAD - HEADER_LEN {
            return Err(ConfigError::SegmentSize(self.max_segment_size));
        }
        if self.retransmit_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }
}

/// A [`RudpConfig`] value the engine refuses to run with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("window size must be at least 1")]
    ZeroWindow,
    #[error("segment size {0} does not fit in one datagram")]
    SegmentSize(usize),
    #[error("retransmit interval must be non-zero")]
    ZeroInterval,
}

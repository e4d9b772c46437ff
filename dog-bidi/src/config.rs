use std::time::Duration;

use crate::{BidiError, BidiResult};

/// Configuration for write and read sessions
#[derive(Debug, Clone)]
pub struct BidiConfig {
    /// How outbound buffers are cut into wire messages
    pub segments: SegmentRules,

    /// Upper bound on bytes enqueued but not yet confirmed by the server.
    /// Writers wait once this is reached.
    pub max_pending_bytes: u64,

    /// Consecutive redirects tolerated before the session gives up.
    /// Any successful response resets the count.
    pub max_redirects: u32,

    /// Stream-level retry behaviour
    pub retry: RetrySettings,

    /// Attempts allowed per read range for checksum and offset failures
    pub read_attempts: u32,

    /// If true, `close()` finalizes the object; otherwise it only flushes and the
    /// object stays appendable
    pub finalize_on_close: bool,

    /// How a short terminal ack is treated while finalizing
    pub finalize_ack_policy: FinalizeAckPolicy,

    /// Staging buffers available to write channels of one pool
    pub staging_buffers: usize,
}

impl Default for BidiConfig {
    fn default() -> Self {
        Self {
            segments: SegmentRules::default(),
            max_pending_bytes: 16 * 1024 * 1024, // 16MB
            max_redirects: 3,
            retry: RetrySettings::default(),
            read_attempts: 3,
            finalize_on_close: true,
            finalize_ack_policy: FinalizeAckPolicy::Strict,
            staging_buffers: 4,
        }
    }
}

/// Segment size window
#[derive(Debug, Clone)]
pub struct SegmentRules {
    /// Bytes below this are staged rather than sent, until a flush or close
    pub min_segment_bytes: usize,

    /// Hard cap for a single wire message payload
    pub max_segment_bytes: usize,
}

impl Default for SegmentRules {
    fn default() -> Self {
        Self {
            min_segment_bytes: 256 * 1024,      // 256KB
            max_segment_bytes: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Backoff and attempt budget for retried operations
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Total attempts including the first; 0 means unbounded
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Randomize each backoff between half and the full computed value
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Policy for a terminal ack smaller than the bytes sent while finalizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizeAckPolicy {
    /// Any terminal ack that differs from the bytes sent is data loss
    #[default]
    Strict,
    /// A short terminal ack that still lies above the lowest offset the client holds in
    /// its queue is accepted as progress and the session keeps waiting; anything at or
    /// below that offset is data loss
    AcceptBuffered,
}

impl BidiConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set segment rules
    pub fn with_segments(mut self, rules: SegmentRules) -> Self {
        self.segments = rules;
        self
    }

    /// Set the backpressure bound
    pub fn with_max_pending_bytes(mut self, bytes: u64) -> Self {
        self.max_pending_bytes = bytes;
        self
    }

    /// Set the redirect budget
    pub fn with_max_redirects(mut self, max: u32) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set retry settings
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-range attempt budget
    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.read_attempts = attempts;
        self
    }

    /// Leave the object appendable when the channel is closed
    pub fn close_without_finalizing(mut self) -> Self {
        self.finalize_on_close = false;
        self
    }

    /// Set the finalize ack policy
    pub fn with_finalize_ack_policy(mut self, policy: FinalizeAckPolicy) -> Self {
        self.finalize_ack_policy = policy;
        self
    }

    /// Set the staging buffer count
    pub fn with_staging_buffers(mut self, count: usize) -> Self {
        self.staging_buffers = count;
        self
    }

    /// Reject values no session can work with
    pub fn validate(&self) -> BidiResult<()> {
        let rules = &self.segments;
        if rules.max_segment_bytes == 0 {
            return Err(BidiError::invalid("max_segment_bytes must be greater than zero"));
        }
        if rules.min_segment_bytes > rules.max_segment_bytes {
            return Err(BidiError::invalid(format!(
                "min_segment_bytes {} exceeds max_segment_bytes {}",
                rules.min_segment_bytes, rules.max_segment_bytes
            )));
        }
        if self.max_pending_bytes < rules.max_segment_bytes as u64 {
            return Err(BidiError::invalid(format!(
                "max_pending_bytes {} cannot hold a single segment of {} bytes",
                self.max_pending_bytes, rules.max_segment_bytes
            )));
        }
        if self.read_attempts == 0 {
            return Err(BidiError::invalid("read_attempts must be at least 1"));
        }
        if self.staging_buffers == 0 {
            return Err(BidiError::invalid("staging_buffers must be at least 1"));
        }
        Ok(())
    }
}

impl SegmentRules {
    /// Create new segment rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum segment size
    pub fn with_min_segment(mut self, bytes: usize) -> Self {
        self.min_segment_bytes = bytes;
        self
    }

    /// Set the maximum segment size
    pub fn with_max_segment(mut self, bytes: usize) -> Self {
        self.max_segment_bytes = bytes;
        self
    }
}

impl RetrySettings {
    /// Create new retry settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the backoff window
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    /// Disable jitter
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

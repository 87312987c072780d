//! Monotonic id generator
//!
//! Produces strictly increasing 64-bit ids from a microsecond timestamp.
//! Ids assigned to outbox rows must stay ordered across all aggregates in
//! the process, even when the input clock stalls or steps backwards.

use chrono::Utc;

/// Default number of low bits reserved for the per-microsecond sequence
pub const DEFAULT_SEQUENCE_BITS: u32 = 10;

/// Single-writer generator of strictly increasing 64-bit ids.
///
/// The id layout is `(timestamp_micros << sequence_bits) | sequence`.
/// With the default 10 sequence bits, up to 1024 ids fit into a single
/// microsecond; overflow borrows the next microsecond.
#[derive(Debug)]
pub struct MonotonicId {
    sequence_bits: u32,
    sequence_mask: i64,
    last_ts: i64,
    sequence: i64,
}

impl Default for MonotonicId {
    fn default() -> Self {
        Self::new(DEFAULT_SEQUENCE_BITS)
    }
}

impl MonotonicId {
    /// Create a generator with the given sequence-bit width
    pub fn new(sequence_bits: u32) -> Self {
        assert!(
            sequence_bits > 0 && sequence_bits < 20,
            "sequence_bits out of range"
        );
        Self {
            sequence_bits,
            sequence_mask: (1i64 << sequence_bits) - 1,
            last_ts: 0,
            sequence: 0,
        }
    }

    /// Produce the next id for the given microsecond timestamp.
    ///
    /// Non-monotonic inputs are clamped to the last observed timestamp, so
    /// successive ids are strictly increasing regardless of clock skew.
    pub fn next(&mut self, ts_micros: i64) -> i64 {
        let mut ts = ts_micros.max(self.last_ts);

        if ts == self.last_ts {
            self.sequence = (self.sequence + 1) & self.sequence_mask;
            if self.sequence == 0 {
                // Sequence exhausted within this microsecond
                ts += 1;
            }
        } else {
            self.sequence = 0;
        }

        self.last_ts = ts;
        (ts << self.sequence_bits) | self.sequence
    }

    /// Produce the next id using the current wall clock
    pub fn next_now(&mut self) -> i64 {
        self.next(now_micros())
    }
}

/// Current wall-clock time in microseconds
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

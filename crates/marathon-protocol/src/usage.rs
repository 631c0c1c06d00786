use std::ops::AddAssign;

use crate::cursor::ParseCursor;
use crate::error::Error;
use crate::wire::{FromWire, ToWire};

/// Per-task resource counters. Additive and monotonic: deltas are folded in
/// with `+=` as a task runs, never subtracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageMetrics {
    pub compute_time_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub tool_calls: i64,
}

impl UsageMetrics {
    pub const WIRE_SIZE: usize = 6 * 8;

    pub fn is_zero(&self) -> bool {
        *self == UsageMetrics::default()
    }

    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

impl AddAssign for UsageMetrics {
    fn add_assign(&mut self, rhs: Self) {
        self.compute_time_ms += rhs.compute_time_ms;
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cache_read_tokens += rhs.cache_read_tokens;
        self.cache_write_tokens += rhs.cache_write_tokens;
        self.tool_calls += rhs.tool_calls;
    }
}

impl ToWire for UsageMetrics {
    fn wire_size(&self) -> usize {
        Self::WIRE_SIZE
    }

    fn to_wire(&self, cursor: &mut ParseCursor) -> Result<(), Error> {
        cursor.try_put_i64(self.compute_time_ms)?;
        cursor.try_put_i64(self.input_tokens)?;
        cursor.try_put_i64(self.output_tokens)?;
        cursor.try_put_i64(self.cache_read_tokens)?;
        cursor.try_put_i64(self.cache_write_tokens)?;
        cursor.try_put_i64(self.tool_calls)
    }
}

impl FromWire for UsageMetrics {
    fn from_wire(cursor: &mut ParseCursor) -> Result<Self, Error> {
        Ok(UsageMetrics {
            compute_time_ms: cursor.try_get_i64()?,
            input_tokens: cursor.try_get_i64()?,
            output_tokens: cursor.try_get_i64()?,
            cache_read_tokens: cursor.try_get_i64()?,
            cache_write_tokens: cursor.try_get_i64()?,
            tool_calls: cursor.try_get_i64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::decode_exact;

    fn sample() -> UsageMetrics {
        UsageMetrics {
            compute_time_ms: 120_000,
            input_tokens: 54_321,
            output_tokens: 9_876,
            cache_read_tokens: 1_000,
            cache_write_tokens: 500,
            tool_calls: 42,
        }
    }

    #[test]
    fn wire_round_trip() {
        let metrics = sample();
        let mut bytes = metrics.as_bytes().unwrap();
        assert_eq!(bytes.len(), UsageMetrics::WIRE_SIZE);

        let decoded = decode_exact::<UsageMetrics>(&mut bytes).unwrap();
        assert_eq!(decoded, metrics);
    }

    #[test]
    fn add_assign_accumulates() {
        let mut total = UsageMetrics::default();
        assert!(total.is_zero());

        total += sample();
        total += sample();

        assert_eq!(total.compute_time_ms, 240_000);
        assert_eq!(total.input_tokens, 108_642);
        assert_eq!(total.tool_calls, 84);
        assert!(!total.is_zero());
    }

    #[test]
    fn total_tokens_sums_all_token_classes() {
        assert_eq!(sample().total_tokens(), 54_321 + 9_876 + 1_000 + 500);
    }
}

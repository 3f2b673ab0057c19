//! Byte counters.
//!
//! Traffic counters are `u64` everywhere in the domain. SQLite only has a
//! signed 64-bit `INTEGER`, so values are stored bit-for-bit: anything above
//! `i64::MAX` lands in the column as a negative number and reads back as the
//! original `u64`. Accumulation saturates at `u64::MAX` instead of wrapping,
//! so a counter never appears to go backwards.

pub fn to_column(value: u64) -> i64 {
    value as i64
}

pub fn from_column(value: i64) -> u64 {
    value as u64
}

/// Adds `delta` to a stored counter, saturating at `u64::MAX`.
pub fn accumulate(stored: i64, delta: u64) -> i64 {
    to_column(from_column(stored).saturating_add(delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_above_i64_max_survive_the_column() {
        let big = u64::MAX - 7;
        let stored = to_column(big);
        assert!(stored < 0);
        assert_eq!(from_column(stored), big);
    }

    #[test]
    fn accumulate_saturates_instead_of_wrapping() {
        let near_max = to_column(u64::MAX - 10);
        let result = accumulate(near_max, 100);
        assert_eq!(from_column(result), u64::MAX);

        let result = accumulate(to_column(1_000), 24);
        assert_eq!(from_column(result), 1_024);
    }
}

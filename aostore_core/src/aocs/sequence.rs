use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Row numbers handed out per fast-sequence request.
pub const NUM_FAST_SEQUENCES: i64 = 100;

/// Hands out row numbers per (segment relation, segment number). Numbers are
/// never handed out twice, even if the requesting transaction aborts.
pub trait FastSequence: Send + Sync {
    /// Reserve `n` consecutive row numbers, none below `start`. Returns the
    /// first.
    fn get_next_n(&self, segrelid: u32, segno: u32, start: i64, n: i64) -> Result<i64>;
}

#[derive(Debug, Default)]
pub struct InMemoryFastSequence {
    last: Mutex<HashMap<(u32, u32), i64>>,
}

impl InMemoryFastSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last row number handed out, or 0.
    pub fn last_value(&self, segrelid: u32, segno: u32) -> i64 {
        self.last.lock().get(&(segrelid, segno)).copied().unwrap_or(0)
    }
}

impl FastSequence for InMemoryFastSequence {
    fn get_next_n(&self, segrelid: u32, segno: u32, start: i64, n: i64) -> Result<i64> {
        if n <= 0 || start <= 0 {
            return Err(Error::contract(format!(
                "fast sequence request of {} numbers from {}",
                n, start
            )));
        }
        let mut last = self.last.lock();
        let last = last.entry((segrelid, segno)).or_insert(0);
        let first = start.max(*last + 1);
        *last = first + n - 1;
        Ok(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_never_reused() {
        let seq = InMemoryFastSequence::new();
        assert_eq!(seq.get_next_n(9, 0, 1, 100).unwrap(), 1);
        // a writer that committed nothing asks again from the same start
        assert_eq!(seq.get_next_n(9, 0, 1, 100).unwrap(), 101);
        assert_eq!(seq.get_next_n(9, 0, 500, 100).unwrap(), 500);
        assert_eq!(seq.last_value(9, 0), 599);
        assert_eq!(seq.get_next_n(9, 1, 1, 10).unwrap(), 1);
        assert!(seq.get_next_n(9, 0, 1, 0).is_err());
    }
}

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::SeqCst;

/// Monotonic atomic counter used for process-wide unique slice and context
/// ids, and for csn allocation in the local redo log.
pub(crate) struct MonotonicSeq {
    value: AtomicU64,
}

impl MonotonicSeq {
    pub(crate) fn new(initial_value: u64) -> Self {
        Self {
            value: AtomicU64::new(initial_value),
        }
    }

    pub(crate) fn next(&self) -> u64 {
        self.value.fetch_add(1, SeqCst) + 1
    }

    pub(crate) fn load(&self) -> u64 {
        self.value.load(SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_seq_increments() {
        let seq = MonotonicSeq::new(0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.load(), 2);
    }
}

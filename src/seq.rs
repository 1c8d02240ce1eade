//! Sequence number arithmetic.
//!
//! Sequence numbers are 32 bits wide on the wire and wrap around, so ordering
//! is defined by the signed distance between two numbers rather than by their
//! raw values.

pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// Returns true if `lo < seq <= hi`.
pub(crate) fn seq_in_window(seq: u32, lo: u32, hi: u32) -> bool {
    seq_gt(seq, lo) && seq_le(seq, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_across_wrap() {
        assert!(seq_lt(1, 2));
        assert!(seq_lt(u32::MAX, 0));
        assert!(seq_gt(3, u32::MAX - 3));
        assert!(seq_le(7, 7));
        assert!(!seq_lt(7, 7));
    }

    #[test]
    fn window() {
        assert!(seq_in_window(11, 10, 20));
        assert!(seq_in_window(20, 10, 20));
        assert!(!seq_in_window(10, 10, 20));
        assert!(!seq_in_window(21, 10, 20));
        assert!(seq_in_window(2, u32::MAX - 1, 5));
    }
}

use bytes::{Bytes, BytesMut};

/// A bounded byte ring holding the most recent `max` bytes written to it
/// (§3 Replay ring). Always contains a suffix of everything ever pushed.
pub struct ReplayRing {
    buf: BytesMut,
    max: usize,
}

impl ReplayRing {
    pub fn new(max: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max.min(64 * 1024)),
            max,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.max {
            let excess = self.buf.len() - self.max;
            let _ = self.buf.split_to(excess);
        }
    }

    /// A copy of the current suffix, at most `max` bytes.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_the_bound() {
        let mut ring = ReplayRing::new(10);
        ring.push(b"hello");
        assert_eq!(&ring.snapshot()[..], b"hello");
    }

    #[test]
    fn keeps_exact_bound_size() {
        let mut ring = ReplayRing::new(5);
        ring.push(b"abcde");
        assert_eq!(&ring.snapshot()[..], b"abcde");
    }

    #[test]
    fn drops_head_byte_at_bound_plus_one() {
        let mut ring = ReplayRing::new(5);
        ring.push(b"abcdef");
        assert_eq!(&ring.snapshot()[..], b"bcdef");
    }

    #[test]
    fn keeps_suffix_across_multiple_pushes() {
        let mut ring = ReplayRing::new(5);
        ring.push(b"abc");
        ring.push(b"defgh");
        assert_eq!(&ring.snapshot()[..], b"defgh");
    }
}

use tracing::debug;

const DEFAULT_SIZE: usize = 128;
const GROW_MARGIN: usize = DEFAULT_SIZE * 16;
const SHRINK_SIZE: usize = 1024 * DEFAULT_SIZE;
const DOWN_SIZE: usize = SHRINK_SIZE / 16;
const UNDERUSE_TICKS: u32 = 100;

/// Contiguous byte queue used for per-connection send/receive buffering.
///
/// Appends are amortized: growth adds both a geometric and an additive
/// margin so a run of tiny appends does not resize on every call. Popping
/// from the front only advances an index. Once the backing storage exceeds
/// [`SHRINK_SIZE`] and stays almost empty for [`UNDERUSE_TICKS`] consecutive
/// appends, the data is compacted to the front and the storage steps down by
/// [`DOWN_SIZE`]; a single busy append resets the countdown.
///
/// The write side can be exposed as a raw tail slice
/// ([`ensure_writable`](Self::ensure_writable) /
/// [`writable_begin`](Self::writable_begin) / [`commit`](Self::commit)) so a
/// `read(2)` can land bytes directly in place.
pub struct ElasticBuffer {
    inner: Vec<u8>,
    read_start: usize,
    write_start: usize,
    underuse: u32,
}

impl Default for ElasticBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ElasticBuffer {
    pub fn new() -> Self {
        Self { inner: vec![0; DEFAULT_SIZE], read_start: 0, write_start: 0, underuse: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.write_start - self.read_start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_start == self.write_start
    }

    /// The buffered bytes, oldest first.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.inner[self.read_start..self.write_start]
    }

    pub fn push_back(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.reserve_tail(data.len());
        self.inner[self.write_start..self.write_start + data.len()].copy_from_slice(data);
        self.write_start += data.len();
    }

    /// Discards up to `n` bytes from the front.
    pub fn pop_front(&mut self, n: usize) {
        self.read_start += n.min(self.len());
        if self.read_start == self.write_start {
            self.read_start = 0;
            self.write_start = 0;
        }
    }

    /// Makes room for at least `n` more bytes at the tail.
    pub fn ensure_writable(&mut self, n: usize) {
        self.reserve_tail(n);
    }

    /// Raw tail slice to read into; pair with [`commit`](Self::commit).
    #[inline]
    pub fn writable_begin(&mut self) -> &mut [u8] {
        &mut self.inner[self.write_start..]
    }

    /// Marks `n` bytes of the tail slice as filled.
    pub fn commit(&mut self, n: usize) {
        busbar_utils::safe_assert!(self.write_start + n <= self.inner.len());
        self.write_start = (self.write_start + n).min(self.inner.len());
    }

    pub fn clear(&mut self) {
        self.read_start = 0;
        self.write_start = 0;
        self.underuse = 0;
    }

    fn reserve_tail(&mut self, incoming: usize) {
        self.maybe_shrink(incoming);
        if self.inner.len() - self.write_start < incoming {
            let grown = self.write_start * 2 + incoming + GROW_MARGIN;
            self.inner.resize(grown, 0);
            debug!(capacity = grown, used = self.len(), "buffer: grew");
        }
    }

    fn maybe_shrink(&mut self, incoming: usize) {
        if self.inner.len() <= SHRINK_SIZE {
            return;
        }
        let free = self.inner.len().saturating_sub(self.len() + incoming);
        if free > self.inner.len() / 8 * 7 {
            self.underuse += 1;
            if self.underuse > UNDERUSE_TICKS {
                self.underuse = 0;
                let used = self.len();
                debug!(capacity = self.inner.len(), used, "buffer: shrinking");
                if self.read_start > 0 {
                    self.inner.copy_within(self.read_start..self.write_start, 0);
                }
                self.read_start = 0;
                self.write_start = used;
                let floor = used.max(DEFAULT_SIZE);
                self.inner.truncate((self.inner.len() - DOWN_SIZE).max(floor));
            }
        } else {
            self.underuse = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_logical_sequence() {
        let mut buf = ElasticBuffer::new();
        let mut expect: Vec<u8> = Vec::new();
        for round in 0u8..200 {
            let chunk: Vec<u8> = (0..37).map(|i| round.wrapping_add(i)).collect();
            buf.push_back(&chunk);
            expect.extend_from_slice(&chunk);
            if round % 3 == 0 {
                let n = (round as usize * 7) % (expect.len() + 1);
                buf.pop_front(n);
                expect.drain(..n);
            }
            assert_eq!(buf.data(), expect.as_slice());
        }
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = ElasticBuffer::new();
        let big = vec![0xab_u8; DEFAULT_SIZE * 10];
        buf.push_back(&big);
        assert_eq!(buf.data(), big.as_slice());
    }

    #[test]
    fn pop_beyond_len_empties_the_buffer() {
        let mut buf = ElasticBuffer::new();
        buf.push_back(b"hello");
        buf.pop_front(1000);
        assert!(buf.is_empty());
        assert_eq!(buf.data(), b"");
    }

    #[test]
    fn direct_ingest_roundtrip() {
        let mut buf = ElasticBuffer::new();
        buf.push_back(b"head-");
        buf.ensure_writable(4096);
        let tail = buf.writable_begin();
        assert!(tail.len() >= 4096);
        tail[..4].copy_from_slice(b"tail");
        buf.commit(4);
        assert_eq!(buf.data(), b"head-tail");
    }

    #[test]
    fn sustained_underuse_shrinks_storage() {
        let mut buf = ElasticBuffer::new();
        // Inflate the backing storage well past the shrink threshold.
        let big = vec![1_u8; SHRINK_SIZE * 2];
        buf.push_back(&big);
        buf.pop_front(big.len() - 16);
        let inflated = buf.inner.len();
        assert!(inflated > SHRINK_SIZE);

        // Mostly-empty appends must tick the counter past the damping window
        // before anything shrinks.
        for _ in 0..=UNDERUSE_TICKS {
            buf.push_back(b"x");
            buf.pop_front(1);
        }
        assert!(buf.inner.len() < inflated);
        // the tail of `big` has been popped away one byte per tick by now
        assert_eq!(buf.data(), &[b'x'; 16]);
    }

    #[test]
    fn busy_append_resets_the_shrink_countdown() {
        let mut buf = ElasticBuffer::new();
        let big = vec![2_u8; SHRINK_SIZE * 2];
        buf.push_back(&big);
        buf.pop_front(big.len());
        let inflated = buf.inner.len();

        for i in 0..(UNDERUSE_TICKS as usize * 3) {
            if i % (UNDERUSE_TICKS as usize / 2) == 0 {
                // periodically look busy
                let filler = vec![3_u8; SHRINK_SIZE];
                buf.push_back(&filler);
                buf.pop_front(filler.len());
            } else {
                buf.push_back(b"y");
                buf.pop_front(1);
            }
        }
        assert_eq!(buf.inner.len(), inflated);
    }
}

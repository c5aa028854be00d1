// ============================================================================
// exchange.rs — particle-sync
// Ping-pong pair of simulation buffers selected by a single toggle index.
// ============================================================================

/// Two buffers with alternating ownership.
///
/// `current_write_buffer()` belongs to the stage filling the pair and
/// `current_read_buffer()` to the stage draining it. Ownership flips only in
/// [`advance`](Self::advance). No lock guards the index: a single thread
/// drives it and every cross-queue access is ordered by fence values.
pub struct BufferExchange<B> {
    buffers: [B; 2],
    // Index of the read buffer. The write buffer is the other one.
    index: usize,
    // Fence value after which each buffer is no longer read.
    released: [u64; 2],
    toggles: u64,
}

impl<B> BufferExchange<B> {
    pub fn new(buffers: [B; 2]) -> Self {
        Self {
            buffers,
            index: 0,
            released: [0; 2],
            toggles: 0,
        }
    }

    /// Toggle index, 0 or 1.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current_write_buffer(&self) -> &B {
        &self.buffers[self.index ^ 1]
    }

    pub fn current_read_buffer(&self) -> &B {
        &self.buffers[self.index]
    }

    /// Flips ownership. Call once per completed exchange cycle, after the
    /// write into `current_write_buffer()` has been submitted.
    pub fn advance(&mut self) {
        self.index ^= 1;
        self.toggles += 1;
    }

    /// Records that readers of the current read buffer finish at `value`.
    pub fn mark_read(&mut self, value: u64) {
        self.released[self.index] = self.released[self.index].max(value);
    }

    /// Fence value the writer must wait for before reusing the write buffer.
    pub fn write_release_value(&self) -> u64 {
        self.released[self.index ^ 1]
    }

    /// Number of completed exchange cycles.
    pub fn toggles(&self) -> u64 {
        self.toggles
    }

    pub fn buffers(&self) -> &[B; 2] {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_alternates_strictly() {
        let mut exchange = BufferExchange::new(["a", "b"]);
        let mut seen = Vec::new();
        for _ in 0..5 {
            let before = exchange.index();
            exchange.advance();
            assert_eq!(exchange.index(), 1 - before);
            seen.push(exchange.index());
        }
        assert_eq!(seen, [1, 0, 1, 0, 1]);
        assert_eq!(exchange.toggles(), 5);
    }

    #[test]
    fn written_buffer_becomes_readable_after_advance() {
        let mut exchange = BufferExchange::new(["a", "b"]);
        let written = *exchange.current_write_buffer();
        assert_ne!(written, *exchange.current_read_buffer());
        exchange.advance();
        assert_eq!(*exchange.current_read_buffer(), written);
    }

    #[test]
    fn release_values_follow_their_buffer() {
        let mut exchange = BufferExchange::new(["a", "b"]);
        exchange.advance();
        exchange.mark_read(4);
        // "b" is read until 4; the writer targets "a", which was never read.
        assert_eq!(exchange.write_release_value(), 0);
        exchange.advance();
        assert_eq!(*exchange.current_write_buffer(), "b");
        assert_eq!(exchange.write_release_value(), 4);
        exchange.mark_read(3);
        exchange.advance();
        assert_eq!(*exchange.current_write_buffer(), "a");
        assert_eq!(exchange.write_release_value(), 3);
    }
}

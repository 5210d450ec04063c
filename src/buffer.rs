//! Token accumulator shared by every incremental parser.
//!
//! Parsers push one byte at a time while scanning for a delimiter. The first
//! `N` bytes of a token live in an inline array; the byte that would overflow
//! it flushes the inline run into a heap buffer and the accumulator stays in
//! heap mode until [`ByteAccumulator::reset`]. The heap allocation survives a
//! reset so the next token reuses it.

use std::fmt;

/// Default inline capacity used by the request parsers.
pub const INLINE_CAPACITY: usize = 4096;

/// Heap growth failed while accumulating a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("out of memory while accumulating bytes")
    }
}

impl std::error::Error for OutOfMemory {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Inline,
    Heap,
}

pub struct ByteAccumulator<const N: usize = INLINE_CAPACITY> {
    inline: [u8; N],
    inline_len: usize,
    heap: Vec<u8>,
    mode: Mode,
}

impl<const N: usize> ByteAccumulator<N> {
    pub fn new() -> Self {
        Self {
            inline: [0; N],
            inline_len: 0,
            heap: Vec::new(),
            mode: Mode::Inline,
        }
    }

    /// Appends one byte.
    ///
    /// When the inline array is already full the inline run is moved to the
    /// heap buffer first, so exactly `N` bytes fit before promotion.
    pub fn push(&mut self, byte: u8) -> Result<(), OutOfMemory> {
        if self.inline_len == N {
            self.flush()?;
            self.mode = Mode::Heap;
        }

        self.inline[self.inline_len] = byte;
        self.inline_len += 1;

        Ok(())
    }

    /// Pushes every byte of `bytes` in order.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), OutOfMemory> {
        for &byte in bytes {
            self.push(byte)?;
        }
        Ok(())
    }

    /// Makes the whole token contiguous.
    ///
    /// Must be called before [`get`](Self::get), [`back`](Self::back) or
    /// [`pop_back`](Self::pop_back) once the accumulator may be in heap mode.
    pub fn complete(&mut self) -> Result<(), OutOfMemory> {
        if self.mode == Mode::Heap {
            self.flush()?;
        }
        Ok(())
    }

    /// Logical length of the accumulated token.
    pub fn written(&self) -> usize {
        match self.mode {
            Mode::Inline => self.inline_len,
            Mode::Heap => self.heap.len() + self.inline_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.written() == 0
    }

    pub fn is_heap(&self) -> bool {
        self.mode == Mode::Heap
    }

    /// Contiguous content as of the last [`complete`](Self::complete).
    pub fn get(&self) -> &[u8] {
        match self.mode {
            Mode::Inline => &self.inline[..self.inline_len],
            Mode::Heap => &self.heap,
        }
    }

    /// Content as UTF-8, if it is valid.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.get()).ok()
    }

    /// Owned copy of the content. The caller owns the returned buffer.
    pub fn copy(&self) -> Result<Vec<u8>, OutOfMemory> {
        let content = self.get();
        let mut out = Vec::new();
        out.try_reserve_exact(content.len()).map_err(|_| OutOfMemory)?;
        out.extend_from_slice(content);
        Ok(out)
    }

    pub fn back(&self) -> Option<u8> {
        self.get().last().copied()
    }

    pub fn pop_back(&mut self) -> Option<u8> {
        match self.mode {
            Mode::Inline => {
                if self.inline_len == 0 {
                    return None;
                }
                self.inline_len -= 1;
                Some(self.inline[self.inline_len])
            }
            Mode::Heap => self.heap.pop(),
        }
    }

    /// Empties the accumulator and returns to inline mode. Heap capacity is kept.
    pub fn reset(&mut self) {
        self.inline_len = 0;
        self.heap.clear();
        self.mode = Mode::Inline;
    }

    fn flush(&mut self) -> Result<(), OutOfMemory> {
        if self.inline_len == 0 {
            return Ok(());
        }

        self.heap
            .try_reserve(self.inline_len)
            .map_err(|_| OutOfMemory)?;
        self.heap.extend_from_slice(&self.inline[..self.inline_len]);
        self.inline_len = 0;

        Ok(())
    }
}

impl<const N: usize> Default for ByteAccumulator<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for ByteAccumulator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteAccumulator")
            .field("mode", &self.mode)
            .field("written", &self.written())
            .finish()
    }
}

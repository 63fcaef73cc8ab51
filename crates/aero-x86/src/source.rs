//! Instruction byte cursor over guest memory.

use core::fmt;
use core::ops::{Deref, DerefMut};

use memory::GuestMemory;

use crate::error::{DecodeAbort, DecodeError};

/// How far a bound [`ByteSource`] may read past its start address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Reads stop at the end of the contiguous region containing the start address.
    Region,
    /// Reads continue into the following region as long as it is mapped.
    Spanning,
}

/// A peekable, consumable stream of instruction bytes.
///
/// A source starts detached. Binding attaches it to an address space at a linear address and
/// resets the cursor; every read on a detached source aborts with [`DecodeAbort::Unbound`].
///
/// A binding may carry a limit: the number of bytes past the start address that lie inside the
/// code segment. Reads beyond it abort with [`DecodeAbort::SegmentLimit`] whatever the fetch mode.
pub struct ByteSource<'m> {
    memory: Option<&'m dyn GuestMemory>,
    start: u64,
    consumed: u64,
    fetch: FetchMode,
    limit: Option<u64>,
}

impl<'m> ByteSource<'m> {
    pub const fn detached() -> Self {
        Self {
            memory: None,
            start: 0,
            consumed: 0,
            fetch: FetchMode::Region,
            limit: None,
        }
    }

    /// Attach to `memory` at `linear`, replacing any previous binding.
    pub fn bind(&mut self, memory: &'m dyn GuestMemory, linear: u64, fetch: FetchMode) {
        self.bind_limited(memory, linear, fetch, None);
    }

    /// Like [`bind`](Self::bind), but at most `limit` bytes starting at `linear` are readable.
    pub fn bind_limited(
        &mut self,
        memory: &'m dyn GuestMemory,
        linear: u64,
        fetch: FetchMode,
        limit: Option<u64>,
    ) {
        self.memory = Some(memory);
        self.start = linear;
        self.consumed = 0;
        self.fetch = fetch;
        self.limit = limit;
    }

    /// Bind for the lifetime of the returned guard; the source is detached when it drops.
    pub fn bind_scoped<'a>(
        &'a mut self,
        memory: &'m dyn GuestMemory,
        linear: u64,
        fetch: FetchMode,
        limit: Option<u64>,
    ) -> BoundSource<'a, 'm> {
        self.bind_limited(memory, linear, fetch, limit);
        BoundSource { source: self }
    }

    pub fn unbind(&mut self) {
        self.memory = None;
        self.start = 0;
        self.consumed = 0;
        self.limit = None;
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.memory.is_some()
    }

    #[inline]
    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch
    }

    /// Readable bytes past the start address, if the binding is limited.
    #[inline]
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Linear address the source was bound at.
    #[inline]
    pub fn start_address(&self) -> u64 {
        self.start
    }

    /// Linear address of the next unconsumed byte.
    #[inline]
    pub fn address(&self) -> u64 {
        self.start.wrapping_add(self.consumed)
    }

    /// Bytes consumed since the last bind.
    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Move the cursor back to an earlier position of the current binding.
    pub fn rewind_to(&mut self, consumed: u64) {
        debug_assert!(consumed <= self.consumed);
        self.consumed = consumed.min(self.consumed);
    }

    /// Byte `offset` positions past the cursor, without consuming it.
    pub fn peek_byte(&self, offset: u64) -> Result<u8, DecodeError> {
        let memory = self.memory.ok_or(DecodeAbort::Unbound)?;
        let addr = self.readable(memory, self.consumed, offset)?;
        Ok(memory.read_u8_le(addr)?)
    }

    pub fn next_byte(&mut self) -> Result<u8, DecodeError> {
        let b = self.peek_byte(0)?;
        self.consumed += 1;
        Ok(b)
    }

    /// Consume `len` (at most 8) bytes as a little-endian integer.
    pub fn read_le(&mut self, len: usize) -> Result<u64, DecodeError> {
        debug_assert!(len <= 8);
        let mut value = 0u64;
        for i in 0..len {
            value |= u64::from(self.peek_byte(i as u64)?) << (i * 8);
        }
        self.consumed += len as u64;
        Ok(value)
    }

    /// Copy as many upcoming bytes as are readable into `dst` without consuming them.
    ///
    /// Returns the number of bytes copied, which is short when the fetch boundary is reached.
    pub fn peek_into(&self, dst: &mut [u8]) -> Result<usize, DecodeError> {
        for (i, slot) in dst.iter_mut().enumerate() {
            match self.peek_byte(i as u64) {
                Ok(b) => *slot = b,
                Err(DecodeError::Abort(abort)) if abort.is_fetch_boundary() => return Ok(i),
                Err(err) => return Err(err),
            }
        }
        Ok(dst.len())
    }

    /// Consume `len` bytes. Fails without moving the cursor if any of them is not readable.
    pub fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        if len == 0 {
            return Ok(());
        }
        let memory = self.memory.ok_or(DecodeAbort::Unbound)?;
        for i in 0..len as u64 {
            self.readable(memory, self.consumed, i)?;
        }
        self.consumed += len as u64;
        Ok(())
    }

    fn readable(
        &self,
        memory: &dyn GuestMemory,
        consumed: u64,
        offset: u64,
    ) -> Result<u64, DecodeError> {
        let rel = consumed.saturating_add(offset);
        if self.limit.is_some_and(|limit| rel >= limit) {
            return Err(DecodeAbort::SegmentLimit {
                address: self.start.saturating_add(rel),
            }
            .into());
        }
        let end_of_region = || DecodeAbort::EndOfRegion {
            address: self.start.saturating_add(rel),
        };
        let addr = self.start.checked_add(rel).ok_or_else(end_of_region)?;
        let ok = match self.fetch {
            FetchMode::Region => rel < memory.contiguous_len(self.start),
            FetchMode::Spanning => memory.contiguous_len(addr) > 0,
        };
        if ok {
            Ok(addr)
        } else {
            Err(end_of_region().into())
        }
    }
}

impl Default for ByteSource<'_> {
    fn default() -> Self {
        Self::detached()
    }
}

impl fmt::Debug for ByteSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("bound", &self.is_bound())
            .field("start", &format_args!("{:#x}", self.start))
            .field("consumed", &self.consumed)
            .field("fetch", &self.fetch)
            .field("limit", &self.limit)
            .finish()
    }
}

/// A [`ByteSource`] bound for a single decode attempt.
pub struct BoundSource<'a, 'm> {
    source: &'a mut ByteSource<'m>,
}

impl<'m> Deref for BoundSource<'_, 'm> {
    type Target = ByteSource<'m>;

    fn deref(&self) -> &Self::Target {
        self.source
    }
}

impl<'m> DerefMut for BoundSource<'_, 'm> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.source
    }
}

impl Drop for BoundSource<'_, '_> {
    fn drop(&mut self) {
        self.source.unbind();
    }
}

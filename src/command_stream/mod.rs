// Copyright (c) 2024 The silica developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Append-only, auto-growing streams of GPU command words.
//!
//! A [`CommandStream`] is owned by a single producer at a time and records 32-bit
//! command words into one or more backing [`Bo`]s. Three operating modes exist:
//!
//! - **Grow**: backing buffers are allocated on demand, and each contiguous span
//!   of words is closed out as a [`CsEntry`] for later indirect-buffer chaining.
//! - **External**: the stream wraps a caller-provided fixed range and can never
//!   grow; running out of space is a caller sizing bug and panics.
//! - **Sub-stream**: a parent stream from which temporary nested streams (and
//!   size-aligned scratch memory) are carved without separate backing
//!   allocations.
//!
//! The invariant underpinning all three: the stream never has a dangling
//! partially-reserved region when a buffer switch occurs. [`reserve`] closes the
//! current span as an entry first, patches every open conditional-execution
//! region's length word, and re-opens equivalent region markers in the fresh
//! buffer, so conditional bookkeeping survives arbitrary growth.
//!
//! [`reserve`]: CommandStream::reserve

pub mod packet;

use crate::{device::Device, DeviceSize, OomError};
use smallvec::SmallVec;
use std::{cell::UnsafeCell, fmt, ptr, slice, sync::Arc};

/// Maximum size of one indirect buffer, in words.
pub const MAX_BO_SIZE_WORDS: u32 = 0x0fffff;

/// Maximum nesting depth of conditional-execution regions.
pub const MAX_COND_DEPTH: usize = 4;

/// A GPU-visible memory allocation backing command words or descriptors.
///
/// The storage is written through [`CommandStream`] under a single-writer
/// discipline while recording; once the stream is submitted, the words are only
/// read, and CPU/GPU handoff is synchronized externally through the batch fence.
pub struct Bo {
    storage: UnsafeCell<Box<[u32]>>,
    size_words: u32,
    iova: u64,
    name: &'static str,
}

// Safety: all writes go through the owning stream's cursor (single writer), and
// shared reads only happen after recording has finished.
unsafe impl Send for Bo {}
unsafe impl Sync for Bo {}

impl Bo {
    pub(crate) fn new(
        device: &Device,
        size_words: u32,
        name: &'static str,
    ) -> Result<Arc<Bo>, OomError> {
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(size_words as usize)
            .map_err(|_| OomError::OutOfHostMemory)?;
        storage.resize(size_words as usize, 0);

        Ok(Arc::new(Bo {
            storage: UnsafeCell::new(storage.into_boxed_slice()),
            size_words,
            iova: device.allocate_iova(size_words as DeviceSize * 4),
            name,
        }))
    }

    /// The GPU virtual address of the allocation.
    #[inline]
    pub fn iova(&self) -> u64 {
        self.iova
    }

    #[inline]
    pub fn size_words(&self) -> u32 {
        self.size_words
    }

    #[inline]
    pub fn size_b(&self) -> DeviceSize {
        self.size_words as DeviceSize * 4
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The CPU mapping of the allocation.
    ///
    /// The box is never reallocated, so the pointer is stable for the lifetime
    /// of the `Bo`.
    pub(crate) fn map(&self) -> *mut u32 {
        unsafe { (*self.storage.get()).as_mut_ptr() }
    }

    /// Reads words out of the allocation.
    ///
    /// # Safety
    ///
    /// The caller must ensure no stream is concurrently writing to this `Bo`
    /// (recording has ended, or completion was observed through a fence).
    pub unsafe fn read(&self, offset_words: u32, len_words: u32) -> &[u32] {
        assert!(offset_words + len_words <= self.size_words);
        unsafe { slice::from_raw_parts(self.map().add(offset_words as usize), len_words as usize) }
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("name", &self.name)
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("size_words", &self.size_words)
            .finish()
    }
}

/// One contiguous span of command words within a [`Bo`], referenced indirectly
/// from a parent stream or submitted as part of a batch.
#[derive(Clone)]
pub struct CsEntry {
    bo: Arc<Bo>,
    offset_b: u32,
    size_b: u32,
}

impl CsEntry {
    #[inline]
    pub fn bo(&self) -> &Arc<Bo> {
        &self.bo
    }

    /// Byte offset of the span within its `Bo`.
    #[inline]
    pub fn offset_b(&self) -> u32 {
        self.offset_b
    }

    /// Byte size of the span.
    #[inline]
    pub fn size_b(&self) -> u32 {
        self.size_b
    }

    #[inline]
    pub fn size_words(&self) -> u32 {
        self.size_b / 4
    }

    /// The GPU virtual address of the span.
    #[inline]
    pub fn iova(&self) -> u64 {
        self.bo.iova() + self.offset_b as u64
    }

    /// Reads the span's words. See [`Bo::read`] for the safety contract.
    ///
    /// # Safety
    ///
    /// Same as [`Bo::read`].
    pub unsafe fn words(&self) -> &[u32] {
        unsafe { self.bo.read(self.offset_b / 4, self.size_b / 4) }
    }

    /// Reads the span as raw bytes, for capture/dump tooling.
    ///
    /// # Safety
    ///
    /// Same as [`Bo::read`].
    pub unsafe fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(unsafe { self.words() })
    }
}

impl fmt::Debug for CsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsEntry")
            .field("bo", &self.bo)
            .field("offset_b", &self.offset_b)
            .field("size_b", &self.size_b)
            .finish()
    }
}

/// Size-aligned scratch memory carved from a sub-stream-mode stream, for
/// writing descriptors and other GPU-read data.
#[derive(Clone, Debug)]
pub struct CsMemory {
    pub bo: Arc<Bo>,
    pub offset_words: u32,
    pub iova: u64,
}

impl CsMemory {
    /// Writes `data` at the start of the scratch range.
    ///
    /// # Safety
    ///
    /// The caller must stay within the allocated range and must be the only
    /// writer of this range.
    pub unsafe fn write(&self, data: &[u32]) {
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.bo.map().add(self.offset_words as usize),
                data.len(),
            );
        }
    }
}

/// The operating mode of a [`CommandStream`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsMode {
    /// Allocates backing buffers on demand and records indirect-buffer entries.
    Grow,
    /// Wraps a fixed caller-provided range; never grows.
    External,
    /// Carves nested streams and scratch memory out of reserved space.
    SubStream,
}

struct CondExec {
    flags: u32,
    bo: Arc<Bo>,
    /// Word offset of the region's length field within `bo`.
    dword_offset: u32,
}

/// An append-only stream of GPU command words. See the [module-level
/// documentation](self).
pub struct CommandStream {
    device: Arc<Device>,
    mode: CsMode,
    name: &'static str,

    bos: Vec<Arc<Bo>>,
    /// Backing range of an external-mode stream.
    external: Option<(Arc<Bo>, u32)>,

    // Write window into the current BO. `map` is the BO's base mapping; the
    // cursors are word offsets from it. `start` marks the beginning of the span
    // not yet closed out as an entry, `cur` the append position, `reserved_end`
    // the end of the current reservation and `end` the end of the BO.
    map: *mut u32,
    start: u32,
    cur: u32,
    reserved_end: u32,
    end: u32,

    next_bo_size: u32,
    entries: Vec<CsEntry>,
    cond_stack: SmallVec<[CondExec; MAX_COND_DEPTH]>,
}

// Safety: `map` points into a Bo kept alive by `bos`/`external`, and the stream
// is the only writer.
unsafe impl Send for CommandStream {}

impl fmt::Debug for CommandStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStream")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("bos", &self.bos.len())
            .field("entries", &self.entries.len())
            .field("cur", &self.cur)
            .finish_non_exhaustive()
    }
}

impl CommandStream {
    /// Creates a command stream in [`Grow`](CsMode::Grow) or
    /// [`SubStream`](CsMode::SubStream) mode.
    ///
    /// `initial_size` is the word size of the first backing buffer; subsequent
    /// buffers double in size up to [`MAX_BO_SIZE_WORDS`].
    pub fn new(
        device: Arc<Device>,
        mode: CsMode,
        initial_size: u32,
        name: &'static str,
    ) -> CommandStream {
        assert!(mode != CsMode::External);
        assert!(initial_size > 0);

        CommandStream {
            device,
            mode,
            name,
            bos: Vec::new(),
            external: None,
            map: ptr::null_mut(),
            start: 0,
            cur: 0,
            reserved_end: 0,
            end: 0,
            next_bo_size: initial_size,
            entries: Vec::new(),
            cond_stack: SmallVec::new(),
        }
    }

    /// Creates a command stream wrapping the fixed word range
    /// `[start_word, end_word)` of `bo`.
    pub fn new_external(
        device: Arc<Device>,
        bo: Arc<Bo>,
        start_word: u32,
        end_word: u32,
    ) -> CommandStream {
        assert!(start_word <= end_word && end_word <= bo.size_words());

        let map = bo.map();
        CommandStream {
            device,
            mode: CsMode::External,
            name: bo.name(),
            bos: Vec::new(),
            external: Some((bo, start_word)),
            map,
            start: start_word,
            cur: start_word,
            reserved_end: start_word,
            end: end_word,
            next_bo_size: 0,
            entries: Vec::new(),
            cond_stack: SmallVec::new(),
        }
    }

    #[inline]
    pub fn mode(&self) -> CsMode {
        self.mode
    }

    /// The entries recorded so far.
    #[inline]
    pub fn entries(&self) -> &[CsEntry] {
        &self.entries
    }

    /// The number of backing buffers currently owned by the stream.
    #[inline]
    pub fn bo_count(&self) -> usize {
        self.bos.len()
    }

    fn current_bo(&self) -> &Arc<Bo> {
        if let Some((bo, _)) = &self.external {
            bo
        } else {
            self.bos.last().expect("stream has no backing buffer")
        }
    }

    /// Number of words emitted since the last entry was closed out.
    #[inline]
    pub fn size_words(&self) -> u32 {
        self.cur - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cur == self.start
    }

    /// Words still available before the end of the current backing buffer.
    #[inline]
    fn space_words(&self) -> u32 {
        self.end - self.cur
    }

    /// The GPU virtual address of the next word to be emitted.
    pub fn cur_iova(&self) -> u64 {
        self.current_bo().iova() + self.cur as u64 * 4
    }

    fn sanity_check(&self) {
        debug_assert!(self.start <= self.cur);
        debug_assert!(self.cur <= self.reserved_end);
        debug_assert!(self.reserved_end <= self.end);
    }

    /// Allocates and appends a backing buffer. Following command words are
    /// emitted into the new buffer.
    fn add_bo(&mut self, size_words: u32) -> Result<(), OomError> {
        // No BO churn in external mode, and no dangling command packet.
        assert!(self.mode != CsMode::External);
        assert!(self.is_empty());

        let bo = Bo::new(&self.device, size_words, self.name)?;

        self.map = bo.map();
        self.start = 0;
        self.cur = 0;
        self.reserved_end = 0;
        self.end = bo.size_words();
        self.bos.push(bo);

        Ok(())
    }

    /// Makes room for one more entry so that [`add_entry`](Self::add_entry)
    /// cannot fail.
    fn reserve_entry(&mut self) -> Result<(), OomError> {
        assert!(self.mode == CsMode::Grow);
        self.entries
            .try_reserve(1)
            .map_err(|_| OomError::OutOfHostMemory)
    }

    /// Closes out `[start, cur)` as an entry.
    fn add_entry(&mut self) {
        assert!(self.mode == CsMode::Grow);
        assert!(!self.is_empty());
        // Because empty entries are disallowed, both add_bo and reserve_entry
        // must already have been called.
        assert!(!self.bos.is_empty());
        assert!(self.entries.len() < self.entries.capacity());

        self.entries.push(CsEntry {
            bo: self.current_bo().clone(),
            offset_b: self.start * 4,
            size_b: self.size_words() * 4,
        });
        self.start = self.cur;
    }

    /// Appends all of `target`'s entries to this stream, closing out the current
    /// span first. The same behavior as an indirect call, without the indirection.
    pub fn add_entries(&mut self, target: &CommandStream) -> Result<(), OomError> {
        assert!(self.mode == CsMode::Grow);
        assert!(target.mode == CsMode::Grow);

        if !self.is_empty() {
            self.add_entry();
        }

        for entry in &target.entries {
            self.reserve_entry()?;
            self.entries.push(entry.clone());
        }

        Ok(())
    }

    /// Begins (or continues) command emission. Sanity checks only.
    pub fn begin(&mut self) {
        assert!(self.mode != CsMode::SubStream);
        assert!(self.is_empty());
    }

    /// Ends command emission, closing the trailing span out as an entry in grow
    /// mode.
    pub fn end(&mut self) {
        assert!(self.mode != CsMode::SubStream);
        assert!(self.cond_stack.is_empty());

        if self.mode == CsMode::Grow && !self.is_empty() {
            self.add_entry();
        }
    }

    /// Begins emission into a nested stream carved from this stream's reserved
    /// space. `self` must be in [`SubStream`](CsMode::SubStream) mode.
    ///
    /// The returned stream is in external mode, ready for emission of up to
    /// `size_words` words, and must be handed back to
    /// [`end_sub_stream`](Self::end_sub_stream).
    pub fn begin_sub_stream(&mut self, size_words: u32) -> Result<CommandStream, OomError> {
        assert!(self.mode == CsMode::SubStream);
        assert!(size_words > 0);

        self.reserve(size_words)?;

        let mut sub = CommandStream::new_external(
            self.device.clone(),
            self.current_bo().clone(),
            self.cur,
            self.reserved_end,
        );
        sub.begin();
        sub.reserve(size_words)
            .expect("reservation in a fixed range cannot fail");

        Ok(sub)
    }

    /// Allocates `count * size_words` words of scratch memory aligned to
    /// `size_words`. `self` must be in [`SubStream`](CsMode::SubStream) mode.
    pub fn alloc(&mut self, count: u32, size_words: u32) -> Result<CsMemory, OomError> {
        assert!(self.mode == CsMode::SubStream);
        assert!(count > 0);
        assert!(size_words > 0 && size_words <= 1024);

        self.reserve(count * size_words + (size_words - 1))?;

        let offset = crate::align_up_u32(self.start, size_words);
        let bo = self.current_bo().clone();
        let memory = CsMemory {
            iova: bo.iova() + offset as u64 * 4,
            offset_words: offset,
            bo,
        };

        self.start = offset + count * size_words;
        self.cur = self.start;

        Ok(memory)
    }

    /// Ends emission into a sub-stream and folds its written extent back into
    /// this stream as an entry. The sub-stream is consumed.
    ///
    /// The entry has the same lifetime as this stream's backing buffer.
    pub fn end_sub_stream(&mut self, mut sub: CommandStream) -> CsEntry {
        assert!(self.mode == CsMode::SubStream);
        assert!(sub.mode == CsMode::External);
        assert!(Arc::ptr_eq(sub.current_bo(), self.current_bo()));
        assert!(sub.start == self.cur && sub.end == self.reserved_end);
        sub.sanity_check();

        sub.end();
        self.cur = sub.cur;

        let entry = CsEntry {
            bo: self.current_bo().clone(),
            offset_b: self.start * 4,
            size_b: self.size_words() * 4,
        };

        self.start = self.cur;

        entry
    }

    /// Reserves space for `reserved_size` words before the next append.
    ///
    /// In grow and sub-stream modes, insufficient space closes the current span
    /// as an entry, patches the open conditional regions, switches to a freshly
    /// allocated buffer of at least `max(next_size, reserved_size)` words and
    /// re-opens the region markers there. The next default size doubles, capped
    /// at [`MAX_BO_SIZE_WORDS`].
    ///
    /// # Panics
    ///
    /// - Panics in external mode if the fixed range cannot satisfy the
    ///   reservation; the caller guaranteed sufficient space, so this is a
    ///   sizing bug, not a runtime condition.
    pub fn reserve(&mut self, reserved_size: u32) -> Result<(), OomError> {
        let mut reserved_size = reserved_size;

        if self.space_words() < reserved_size {
            if self.mode == CsMode::External {
                unreachable!("cannot grow external command stream '{}'", self.name);
            }

            // Close out the span emitted so far; no dangling command packet may
            // cross a buffer switch.
            if !self.is_empty() {
                // Sub-streams have no direct command packets.
                assert!(self.mode != CsMode::SubStream);
                self.add_entry();
            }

            // Terminate every open conditional region: the length field counts
            // the words between it and the end of the buffer's contribution.
            let re_emit_words = 3 * self.cond_stack.len() as u32;
            for cond in &self.cond_stack {
                debug_assert!(Arc::ptr_eq(&cond.bo, self.current_bo()));
                // Subtract one to account for the length field itself.
                unsafe {
                    *self.map.add(cond.dword_offset as usize) = self.cur - cond.dword_offset - 1;
                }
                // Space for the re-opened marker in the next buffer.
                reserved_size += 3;
            }

            let new_size = u32::max(self.next_bo_size, reserved_size + re_emit_words);
            self.add_bo(new_size)?;

            if !self.cond_stack.is_empty() {
                self.reserved_end = self.cur + reserved_size;

                // Re-open the region markers in the new buffer.
                for i in 0..self.cond_stack.len() {
                    let flags = self.cond_stack[i].flags;
                    self.emit(packet::pkt7_header(packet::COND_REG_EXEC, 2));
                    self.emit(flags);

                    self.cond_stack[i].bo = self.current_bo().clone();
                    self.cond_stack[i].dword_offset = self.cur;

                    // Dummy length field, patched at cond_end or the next switch.
                    self.emit(0);
                }
            }

            let doubled = u32::min(new_size << 1, MAX_BO_SIZE_WORDS);
            if self.next_bo_size < doubled {
                self.next_bo_size = doubled;
            }
        }

        assert!(self.space_words() >= reserved_size);
        self.reserved_end = self.cur + reserved_size;

        if self.mode == CsMode::Grow {
            // Reserve an entry for the next buffer switch or for end().
            return self.reserve_entry();
        }

        Ok(())
    }

    /// Appends one command word. Space must have been reserved.
    #[inline]
    pub fn emit(&mut self, value: u32) {
        debug_assert!(self.cur < self.reserved_end, "emit without reservation");

        unsafe {
            *self.map.add(self.cur as usize) = value;
        }
        self.cur += 1;
    }

    /// Appends a slice of command words.
    #[inline]
    pub fn emit_array(&mut self, values: &[u32]) {
        for &value in values {
            self.emit(value);
        }
    }

    /// Appends a type-7 packet header.
    #[inline]
    pub fn emit_pkt7(&mut self, opcode: u8, payload_words: u32) {
        self.emit(packet::pkt7_header(opcode, payload_words));
    }

    /// Opens a conditional-execution region. The region's length field is
    /// patched retroactively by [`cond_end`](Self::cond_end), and the region
    /// bookkeeping survives buffer growth.
    ///
    /// # Panics
    ///
    /// - Panics if [`MAX_COND_DEPTH`] regions are already open.
    pub fn cond_begin(&mut self, flags: u32) -> Result<(), OomError> {
        assert!(self.cond_stack.len() < MAX_COND_DEPTH);

        self.reserve(3)?;
        self.emit(packet::pkt7_header(packet::COND_REG_EXEC, 2));
        self.emit(flags);

        self.cond_stack.push(CondExec {
            flags,
            bo: self.current_bo().clone(),
            dword_offset: self.cur,
        });

        // Dummy length field.
        self.emit(0);

        Ok(())
    }

    /// Closes the innermost conditional-execution region, patching its length
    /// field with the now-known word count.
    pub fn cond_end(&mut self) {
        let cond = self.cond_stack.pop().expect("no open conditional region");

        // Growth re-opens markers in the new buffer, so the field to patch is
        // always in the current one.
        debug_assert!(Arc::ptr_eq(&cond.bo, self.current_bo()));
        unsafe {
            *self.map.add(cond.dword_offset as usize) = self.cur - cond.dword_offset - 1;
        }
    }

    /// Resets the stream to its initial state, discarding all recorded entries.
    ///
    /// The most-recently-used backing buffer is kept to reduce reallocation
    /// churn. Resetting an already-reset stream is a no-op.
    pub fn reset(&mut self) {
        debug_assert!(self.cond_stack.is_empty());

        if self.mode == CsMode::External {
            assert!(self.bos.is_empty() && self.entries.is_empty());
            let base = self.external.as_ref().unwrap().1;
            self.cur = base;
            self.start = base;
            self.reserved_end = base;
            return;
        }

        if !self.bos.is_empty() {
            let last = self.bos.pop().unwrap();
            self.bos.clear();

            self.map = last.map();
            self.start = 0;
            self.cur = 0;
            self.reserved_end = 0;
            self.end = last.size_words();
            self.bos.push(last);
        }

        self.entries.clear();
    }

    /// Emits raw bytes as the payload of an inert no-op packet.
    ///
    /// The payload is clamped to the maximum packet size and padded to whole
    /// words; remainder bytes are merged into one trailing word, so following
    /// command words are never corrupted.
    pub fn emit_debug_string(&mut self, data: &[u8]) -> Result<(), OomError> {
        assert!(self.mode == CsMode::Grow);

        let len = usize::min(data.len(), packet::MAX_PAYLOAD_WORDS as usize * 4);
        let payload_words = (len as u32).div_ceil(4);

        self.reserve(1 + payload_words)?;
        self.emit_pkt7(packet::NOP, payload_words);

        let mut chunks = data[..len].chunks_exact(4);
        for chunk in &mut chunks {
            self.emit(u32::from_le_bytes(chunk.try_into().unwrap()));
        }

        // Copy remainder bytes without reading past the end of the input.
        let remainder = chunks.remainder();
        if !remainder.is_empty() {
            let mut word = [0u8; 4];
            word[..remainder.len()].copy_from_slice(remainder);
            self.emit(u32::from_le_bytes(word));
        }

        Ok(())
    }

    fn emit_debug_marker(&mut self, magic: u32, text: &str) -> Result<(), OomError> {
        // Payload format: <magic><text>\0.
        let mut payload = Vec::with_capacity(4 + text.len() + 1);
        payload.extend_from_slice(&magic.to_le_bytes());
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);

        self.emit_debug_string(&payload)
    }

    /// Embeds a debug message for GPU-side capture tools.
    pub fn emit_debug_msg(&mut self, text: &str) -> Result<(), OomError> {
        self.emit_debug_marker(packet::NOP_MESG, text)
    }

    /// Embeds a trace-region start marker.
    pub fn trace_start(&mut self, label: &str) -> Result<(), OomError> {
        self.emit_debug_marker(packet::NOP_BEGN, label)
    }

    /// Embeds a trace-region end marker.
    pub fn trace_end(&mut self, label: &str) -> Result<(), OomError> {
        self.emit_debug_marker(packet::NOP_END, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::device;

    fn grow_stream(initial: u32) -> CommandStream {
        CommandStream::new(device(), CsMode::Grow, initial, "test")
    }

    #[test]
    fn grow_allocates_bo_of_at_least_requested_size() {
        let mut cs = grow_stream(16);
        cs.begin();

        // Fill the first BO completely.
        cs.reserve(16).unwrap();
        for i in 0..16 {
            cs.emit(i);
        }
        assert_eq!(cs.bo_count(), 1);

        // A 20-word reservation does not fit: exactly one new BO of size >= 20
        // is allocated and the prior span is closed out as one complete entry.
        cs.reserve(20).unwrap();
        assert_eq!(cs.bo_count(), 2);
        assert!(cs.bos[1].size_words() >= 20);
        assert_eq!(cs.entries().len(), 1);
        assert_eq!(cs.entries()[0].size_b(), 16 * 4);
        assert_eq!(cs.entries()[0].offset_b(), 0);

        for i in 0..20 {
            cs.emit(100 + i);
        }
        cs.end();
        assert_eq!(cs.entries().len(), 2);
        assert_eq!(cs.entries()[1].size_b(), 20 * 4);

        unsafe {
            assert_eq!(cs.entries()[0].words()[15], 15);
            assert_eq!(cs.entries()[1].words()[0], 100);
        }
    }

    #[test]
    fn default_size_doubles_up_to_the_cap() {
        let mut cs = grow_stream(16);
        cs.begin();
        cs.reserve(1).unwrap();
        assert_eq!(cs.bos[0].size_words(), 16);
        cs.emit(0);

        cs.reserve(16).unwrap();
        assert_eq!(cs.bos[1].size_words(), 32);

        assert!(cs.next_bo_size <= MAX_BO_SIZE_WORDS);
    }

    #[test]
    fn empty_stream_produces_no_entries() {
        let mut cs = grow_stream(16);
        cs.begin();
        cs.end();
        assert!(cs.entries().is_empty());
        assert_eq!(cs.bo_count(), 0);
    }

    #[test]
    fn reset_is_idempotent_and_keeps_one_bo() {
        let mut cs = grow_stream(16);
        cs.begin();
        cs.reserve(4).unwrap();
        cs.emit_array(&[1, 2, 3, 4]);
        // Force growth so two BOs exist.
        cs.reserve(16).unwrap();
        cs.emit(5);
        cs.end();
        assert_eq!(cs.bo_count(), 2);

        cs.reset();
        assert_eq!(cs.bo_count(), 1);
        assert!(cs.entries().is_empty());
        assert!(cs.is_empty());

        let kept = Arc::as_ptr(&cs.bos[0]);
        cs.reset();
        assert_eq!(cs.bo_count(), 1);
        assert_eq!(Arc::as_ptr(&cs.bos[0]), kept);
        assert!(cs.is_empty());

        // The stream remains usable.
        cs.begin();
        cs.reserve(1).unwrap();
        cs.emit(42);
        cs.end();
        assert_eq!(cs.entries().len(), 1);
    }

    #[test]
    fn debug_string_round_trips_through_nop_packet() {
        let mut cs = grow_stream(64);
        cs.begin();
        cs.emit_debug_msg("hello").unwrap();
        // A word following the no-op packet must be untouched by the payload.
        cs.reserve(1).unwrap();
        cs.emit(0xdead_beef);
        cs.end();

        let words = unsafe { cs.entries()[0].words() };

        assert!(packet::is_pkt7(words[0]));
        assert_eq!(packet::pkt7_opcode(words[0]), packet::NOP);
        // Payload: "MESG" + "hello\0" = 10 bytes -> 3 words.
        let payload_words = packet::pkt7_payload_words(words[0]);
        assert_eq!(payload_words, 3);
        assert_eq!(words[1], packet::NOP_MESG);

        let bytes: &[u8] = bytemuck::cast_slice(&words[2..2 + payload_words as usize - 1]);
        let text: Vec<u8> = bytes.iter().copied().take_while(|&b| b != 0).collect();
        assert_eq!(&text, b"hello");

        // The trailing remainder word merged only 2 live bytes; the next
        // command word is intact right after the packet.
        assert_eq!(words[1 + payload_words as usize], 0xdead_beef);
    }

    #[test]
    fn oversized_debug_string_is_clamped() {
        let mut cs = grow_stream(64);
        cs.begin();
        let big = vec![b'x'; packet::MAX_PAYLOAD_WORDS as usize * 4 + 100];
        cs.emit_debug_string(&big).unwrap();
        cs.end();

        let words = unsafe { cs.entries()[0].words() };
        assert_eq!(
            packet::pkt7_payload_words(words[0]),
            packet::MAX_PAYLOAD_WORDS
        );
    }

    #[test]
    fn cond_region_length_is_patched() {
        let mut cs = grow_stream(64);
        cs.begin();
        cs.cond_begin(0x5).unwrap();
        cs.reserve(4).unwrap();
        cs.emit_array(&[1, 2, 3, 4]);
        cs.cond_end();
        cs.end();

        let words = unsafe { cs.entries()[0].words() };
        assert_eq!(packet::pkt7_opcode(words[0]), packet::COND_REG_EXEC);
        assert_eq!(words[1], 0x5);
        // The length field counts the words after it: 4.
        assert_eq!(words[2], 4);
    }

    #[test]
    fn cond_region_survives_buffer_growth() {
        let mut cs = grow_stream(8);
        cs.begin();
        cs.cond_begin(0x7).unwrap();
        cs.reserve(2).unwrap();
        cs.emit_array(&[10, 11]);

        // Force a buffer switch mid-region.
        cs.reserve(32).unwrap();
        assert_eq!(cs.bo_count(), 2);
        cs.emit_array(&[20, 21, 22]);
        cs.cond_end();
        cs.end();

        assert_eq!(cs.entries().len(), 2);
        let first = unsafe { cs.entries()[0].words() };
        let second = unsafe { cs.entries()[1].words() };

        // First buffer: marker, flags, patched length covering [10, 11].
        assert_eq!(packet::pkt7_opcode(first[0]), packet::COND_REG_EXEC);
        assert_eq!(first[1], 0x7);
        assert_eq!(first[2], 2);
        assert_eq!(&first[3..5], &[10, 11]);

        // Second buffer: the region was re-opened with the same flags, and the
        // final cond_end patched its length to cover [20, 21, 22].
        assert_eq!(packet::pkt7_opcode(second[0]), packet::COND_REG_EXEC);
        assert_eq!(second[1], 0x7);
        assert_eq!(second[2], 3);
        assert_eq!(&second[3..6], &[20, 21, 22]);
    }

    #[test]
    fn sub_streams_fold_back_into_the_parent() {
        let mut parent = CommandStream::new(device(), CsMode::SubStream, 64, "sub");

        let mut sub = parent.begin_sub_stream(8).unwrap();
        sub.emit_array(&[7, 8, 9]);
        let entry = parent.end_sub_stream(sub);

        assert_eq!(entry.size_words(), 3);
        unsafe {
            assert_eq!(entry.words(), &[7, 8, 9]);
        }

        // A second sub-stream continues in the same backing buffer.
        let mut sub = parent.begin_sub_stream(4).unwrap();
        sub.emit(99);
        let entry2 = parent.end_sub_stream(sub);
        assert!(Arc::ptr_eq(entry2.bo(), entry.bo()));
        assert_eq!(entry2.offset_b(), entry.offset_b() + entry.size_b());
    }

    #[test]
    fn alloc_is_size_aligned() {
        let mut parent = CommandStream::new(device(), CsMode::SubStream, 64, "alloc");

        // Misalign the cursor with a 1-word sub-stream.
        let mut sub = parent.begin_sub_stream(1).unwrap();
        sub.emit(1);
        let _ = parent.end_sub_stream(sub);

        let memory = parent.alloc(2, 4).unwrap();
        assert_eq!(memory.offset_words % 4, 0);
        assert_eq!(memory.iova % 16, 0);

        unsafe {
            memory.write(&[1, 2, 3, 4, 5, 6, 7, 8]);
            assert_eq!(memory.bo.read(memory.offset_words, 8), &[1, 2, 3, 4, 5, 6, 7, 8]);
        }
    }

    #[test]
    #[should_panic]
    fn external_overflow_is_fatal() {
        let dev = device();
        let bo = Bo::new(&dev, 4, "external").unwrap();
        let mut cs = CommandStream::new_external(dev, bo, 0, 4);
        cs.begin();
        let _ = cs.reserve(8);
    }

    #[test]
    fn external_stream_writes_into_the_given_range() {
        let dev = device();
        let bo = Bo::new(&dev, 16, "external").unwrap();
        let mut cs = CommandStream::new_external(dev, bo.clone(), 4, 12);
        cs.begin();
        cs.reserve(3).unwrap();
        cs.emit_array(&[5, 6, 7]);
        cs.end();

        unsafe {
            assert_eq!(bo.read(4, 3), &[5, 6, 7]);
        }

        cs.reset();
        assert!(cs.is_empty());
        assert_eq!(cs.cur_iova(), bo.iova() + 16);
    }

    #[test]
    fn add_entries_merges_target_entries() {
        let mut target = grow_stream(16);
        target.begin();
        target.reserve(2).unwrap();
        target.emit_array(&[1, 2]);
        target.end();

        let mut cs = grow_stream(16);
        cs.begin();
        cs.reserve(1).unwrap();
        cs.emit(0);
        cs.add_entries(&target).unwrap();
        cs.end();

        assert_eq!(cs.entries().len(), 2);
        assert_eq!(cs.entries()[1].size_words(), 2);
    }
}

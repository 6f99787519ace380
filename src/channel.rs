//! The bipartite shared-memory-style ring buffer linking pipeline stages.
//!
//! A single writer advances `head` forward through a fixed-capacity byte
//! buffer; when insufficient contiguous space remains to the physical end,
//! it wraps to offset 0 and records the pre-wrap boundary in `high`, bumping
//! `cycle`. Up to [`crate::config::MAX_READERS`] independent readers each
//! track their own `(cycle, pos)` cursor; the writer only ever moves data
//! that no registered reader still needs.
//!
//! The lock (a `Mutex` guarding cursor bookkeeping) is held only while
//! computing placement or updating cursors, never across the bulk copy a
//! caller performs against a mapped slice — that's what makes the map/unmap
//! windows zero-copy.

use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex};

use crate::config::MAX_READERS;
use crate::metrics::ChannelMetrics;

/// Returned when a reader cannot be registered because all
/// [`MAX_READERS`] slots are already in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no free reader slot (max {max} readers)")]
pub struct NoFreeReaderSlot {
    pub max: usize,
}

/// Whether a reader currently holds a mapped (unconsumed) slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Unmapped,
    Mapped,
}

/// The outcome of a reader's most recent `read_map` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    Ok,
    /// The reader fell behind by more than one cycle; its cursor has been
    /// snapped to the writer's current position and data was lost.
    Error,
    /// `read_map` was called again before the previous mapping was unmapped.
    ExpectedUnmapped,
}

struct ReaderSlot {
    pos: usize,
    cycle: u64,
    staged_pos: usize,
    staged_cycle: u64,
    mapped_len: usize,
    state: ReaderState,
    status: ReaderStatus,
}

impl ReaderSlot {
    fn empty() -> Self {
        Self {
            pos: 0,
            cycle: 0,
            staged_pos: 0,
            staged_cycle: 0,
            mapped_len: 0,
            state: ReaderState::Unmapped,
            status: ReaderStatus::Ok,
        }
    }
}

struct Inner {
    capacity: usize,
    head: usize,
    high: usize,
    cycle: u64,
    mapped: usize,
    is_accepting_writes: bool,
    readers: Vec<ReaderSlot>,
    n_readers: usize,
    max_readers: usize,
    metrics: ChannelMetrics,
}

impl Inner {
    /// Lexicographically smallest `(cycle, pos)` among registered readers.
    /// On ties any such reader is an acceptable choice, so plain fold order
    /// suffices.
    fn lagging_reader(&self) -> (u64, usize) {
        self.readers[..self.n_readers]
            .iter()
            .map(|r| (r.cycle, r.pos))
            .min()
            .expect("lagging_reader called with no registered readers")
    }
}

/// A single-writer, multi-reader bipartite ring buffer.
pub struct Channel {
    data: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    inner: Mutex<Inner>,
    space_available: Condvar,
}

// SAFETY: `data` is only ever accessed through the slice ranges the
// protocol hands out, which the writer and a given reader never overlap
// while both outstanding (enforced by cursor bookkeeping under `inner`'s
// lock). Concurrent access to disjoint ranges of the same `UnsafeCell` is
// sound.
unsafe impl Sync for Channel {}

impl Channel {
    #[must_use]
    pub fn new(capacity_bytes: usize, max_readers: usize) -> Self {
        assert!(max_readers >= 1 && max_readers <= MAX_READERS);
        Self {
            data: UnsafeCell::new(vec![0u8; capacity_bytes].into_boxed_slice()),
            capacity: capacity_bytes,
            inner: Mutex::new(Inner {
                capacity: capacity_bytes,
                head: 0,
                high: 0,
                cycle: 0,
                mapped: 0,
                is_accepting_writes: true,
                readers: std::iter::repeat_with(ReaderSlot::empty)
                    .take(max_readers)
                    .collect(),
                n_readers: 0,
                max_readers,
                metrics: ChannelMetrics::new(),
            }),
            space_available: Condvar::new(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets whether the channel accepts new writes, waking any writer
    /// blocked in `write_map` so it can observe the change.
    pub fn accept_writes(&self, accepting: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.is_accepting_writes = accepting;
        drop(inner);
        self.space_available.notify_all();
    }

    #[must_use]
    pub fn metrics(&self) -> ChannelMetrics {
        self.inner.lock().unwrap().metrics
    }

    unsafe fn slice(&self, beg: usize, end: usize) -> &[u8] {
        &(*self.data.get())[beg..end]
    }

    unsafe fn slice_mut(&self, beg: usize, end: usize) -> &mut [u8] {
        &mut (*self.data.get())[beg..end]
    }

    /// Reserves a contiguous region of `nbytes`. Returns `None` immediately
    /// if `nbytes >= capacity`, or if the channel stops accepting writes
    /// while this call was waiting for space.
    pub fn write_map(&self, nbytes: usize) -> Option<WriteReservation<'_>> {
        if nbytes >= self.capacity {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        let beg = loop {
            if inner.n_readers == 0 {
                let mut beg = inner.head;
                if inner.head + nbytes >= inner.capacity {
                    inner.high = inner.head;
                    inner.cycle += 1;
                    inner.head = 0;
                    beg = 0;
                }
                break beg;
            }

            let (lag_cycle, lag_pos) = inner.lagging_reader();
            let head = inner.head;
            let cap = inner.capacity;
            let cycle = inner.cycle;
            let mut placed = None;

            if head < lag_pos {
                if nbytes <= lag_pos - head {
                    placed = Some(head);
                }
            } else if head == lag_pos && lag_cycle + 1 == cycle {
                // channel is full: fall through to wait.
            } else if nbytes <= cap - head {
                placed = Some(head);
            } else if nbytes <= lag_pos {
                inner.high = head;
                inner.cycle += 1;
                inner.head = 0;
                placed = Some(0);
            } else if head == lag_pos && nbytes < cap {
                inner.high = head;
                inner.cycle += 1;
                inner.head = 0;
                let new_cycle = inner.cycle;
                for slot in &mut inner.readers[..inner.n_readers] {
                    slot.pos = 0;
                    slot.cycle = new_cycle;
                }
                inner.metrics.reader_overruns += 1;
                placed = Some(0);
            }

            if let Some(beg) = placed {
                break beg;
            }

            if !inner.is_accepting_writes {
                return None;
            }
            inner.metrics.writer_waits += 1;
            inner = self.space_available.wait(inner).unwrap();
        };

        inner.mapped = beg + nbytes;
        drop(inner);
        Some(WriteReservation {
            channel: self,
            beg,
            len: nbytes,
            done: false,
        })
    }

    fn write_unmap(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_accepting_writes {
            let written = inner.mapped.saturating_sub(inner.head);
            inner.head = inner.mapped;
            inner.metrics.bytes_written += written as u64;
            inner.metrics.frames_written += 1;
        }
        drop(inner);
        self.space_available.notify_all();
    }

    fn abort_write(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.is_accepting_writes {
            inner.mapped = inner.head;
        }
        drop(inner);
        self.space_available.notify_all();
    }

    fn ensure_registered(
        &self,
        inner: &mut Inner,
        reader: &mut ChannelReader,
    ) -> Result<usize, NoFreeReaderSlot> {
        if reader.id != 0 {
            return Ok(reader.id);
        }
        if inner.n_readers >= inner.max_readers {
            return Err(NoFreeReaderSlot {
                max: inner.max_readers,
            });
        }
        let idx = inner.n_readers;
        inner.readers[idx] = ReaderSlot {
            pos: inner.head,
            cycle: inner.cycle,
            staged_pos: inner.head,
            staged_cycle: inner.cycle,
            mapped_len: 0,
            state: ReaderState::Unmapped,
            status: ReaderStatus::Ok,
        };
        inner.n_readers += 1;
        reader.id = idx + 1;
        Ok(reader.id)
    }

    /// Registers `reader` on first use and maps its next available slice.
    /// Empty (zero-length) slices mean "no new data yet", not an error.
    pub fn read_map(&self, reader: &mut ChannelReader) -> Result<&[u8], NoFreeReaderSlot> {
        let mut inner = self.inner.lock().unwrap();
        let id = self.ensure_registered(&mut inner, reader)?;
        let idx = id - 1;

        if inner.readers[idx].state == ReaderState::Mapped {
            inner.readers[idx].status = ReaderStatus::ExpectedUnmapped;
            return Ok(&[]);
        }

        let head = inner.head;
        let cycle = inner.cycle;
        let high = inner.high;
        let (pos, rcycle) = (inner.readers[idx].pos, inner.readers[idx].cycle);

        let (beg, end, staged_pos, staged_cycle) = if pos == head && rcycle == cycle {
            (pos, pos, pos, rcycle)
        } else if pos < head {
            if rcycle != cycle {
                inner.readers[idx].status = ReaderStatus::Error;
                inner.readers[idx].pos = head;
                inner.readers[idx].cycle = cycle;
                inner.readers[idx].mapped_len = 0;
                inner.metrics.reader_overruns += 1;
                return Ok(&[]);
            }
            (pos, head, head, cycle)
        } else {
            if rcycle + 1 != cycle {
                inner.readers[idx].status = ReaderStatus::Error;
                inner.readers[idx].pos = head;
                inner.readers[idx].cycle = cycle;
                inner.readers[idx].mapped_len = 0;
                inner.metrics.reader_overruns += 1;
                return Ok(&[]);
            }
            (pos, high, 0, cycle)
        };

        let slot = &mut inner.readers[idx];
        slot.state = ReaderState::Mapped;
        slot.status = ReaderStatus::Ok;
        slot.staged_pos = staged_pos;
        slot.staged_cycle = staged_cycle;
        slot.mapped_len = end - beg;
        inner.metrics.frames_read += 1;
        drop(inner);
        // SAFETY: [beg, end) is the range just staged for this reader; the
        // writer never places new data inside a range a registered reader
        // still needs.
        Ok(unsafe { self.slice(beg, end) })
    }

    /// Releases a reader's mapped slice, consuming up to `consumed_bytes`
    /// of it (clamped to the slice length).
    pub fn read_unmap(&self, reader: &mut ChannelReader, consumed_bytes: usize) {
        if reader.id == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let idx = reader.id - 1;
        if inner.readers[idx].state != ReaderState::Mapped {
            return;
        }
        let length = inner.readers[idx].mapped_len;
        let consumed = consumed_bytes.min(length);
        if consumed >= length {
            let (sp, sc) = (inner.readers[idx].staged_pos, inner.readers[idx].staged_cycle);
            inner.readers[idx].pos = sp;
            inner.readers[idx].cycle = sc;
        } else {
            inner.readers[idx].pos += consumed;
        }
        let high = inner.high;
        let head = inner.head;
        if head < inner.readers[idx].pos && inner.readers[idx].pos == high {
            inner.readers[idx].pos = 0;
            inner.readers[idx].cycle += 1;
        }
        inner.readers[idx].state = ReaderState::Unmapped;
        inner.metrics.bytes_read += consumed as u64;
        drop(inner);
        self.space_available.notify_all();
    }

    #[must_use]
    pub fn reader_status(&self, reader: &ChannelReader) -> ReaderStatus {
        if reader.id == 0 {
            return ReaderStatus::Ok;
        }
        self.inner.lock().unwrap().readers[reader.id - 1].status
    }

    /// Bytes a reader has yet to consume, accounting for wrap.
    #[must_use]
    pub fn bytes_waiting(&self, reader: &ChannelReader) -> usize {
        if reader.id == 0 {
            return 0;
        }
        let inner = self.inner.lock().unwrap();
        let slot = &inner.readers[reader.id - 1];
        if slot.pos > inner.head {
            (inner.high - slot.pos) + inner.head
        } else {
            inner.head - slot.pos
        }
    }
}

/// A handle to one of a channel's registered readers. Lazily registered on
/// first [`Channel::read_map`] call. Expected to be used from a single
/// thread at a time, per-instance.
#[derive(Debug, Default)]
pub struct ChannelReader {
    id: usize,
}

impl ChannelReader {
    #[must_use]
    pub fn new() -> Self {
        Self { id: 0 }
    }
}

/// An in-progress write, reserved via [`Channel::write_map`]. Must be
/// finalized with [`WriteReservation::commit`] or
/// [`WriteReservation::abort`]; dropping without either aborts the write.
pub struct WriteReservation<'a> {
    channel: &'a Channel,
    beg: usize,
    len: usize,
    done: bool,
}

impl<'a> WriteReservation<'a> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: this range was just reserved exclusively for this write.
        unsafe { self.channel.slice_mut(self.beg, self.beg + self.len) }
    }

    /// Publishes the written bytes, advancing the channel's head.
    pub fn commit(mut self) {
        self.done = true;
        self.channel.write_unmap();
    }

    /// Discards the written bytes without publishing them.
    pub fn abort(mut self) {
        self.done = true;
        self.channel.abort_write();
    }
}

impl<'a> Drop for WriteReservation<'a> {
    fn drop(&mut self) {
        if !self.done {
            self.channel.abort_write();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bytes(ch: &Channel, bytes: &[u8]) {
        let mut r = ch.write_map(bytes.len()).expect("space available");
        r.as_mut_slice().copy_from_slice(bytes);
        r.commit();
    }

    #[test]
    fn single_reader_round_trip_no_wrap() {
        let ch = Channel::new(4096, 8);
        write_bytes(&ch, b"hello");
        write_bytes(&ch, b"world!");

        let mut reader = ChannelReader::new();
        let slice = ch.read_map(&mut reader).unwrap().to_vec();
        assert_eq!(&slice, b"helloworld!");
        ch.read_unmap(&mut reader, slice.len());

        let slice2 = ch.read_map(&mut reader).unwrap();
        assert!(slice2.is_empty());
    }

    #[test]
    fn write_map_rejects_oversized_request() {
        let ch = Channel::new(16, 8);
        assert!(ch.write_map(16).is_none());
        assert!(ch.write_map(17).is_none());
    }

    #[test]
    fn wraps_when_tail_space_insufficient() {
        let ch = Channel::new(32, 8);
        // Register a reader first so the writer takes the reader-aware path.
        let mut reader = ChannelReader::new();
        let _ = ch.read_map(&mut reader).unwrap();
        ch.read_unmap(&mut reader, 0);

        write_bytes(&ch, &[1u8; 20]);
        // Consume so the writer has room to continue without the reader
        // blocking it.
        let s = ch.read_map(&mut reader).unwrap().to_vec();
        ch.read_unmap(&mut reader, s.len());

        // This won't fit in the remaining tail (32-20=12 bytes) so it must wrap.
        write_bytes(&ch, &[2u8; 20]);
        let s2 = ch.read_map(&mut reader).unwrap().to_vec();
        assert_eq!(s2, vec![2u8; 20]);
    }

    #[test]
    fn second_map_without_unmap_reports_expected_unmapped() {
        let ch = Channel::new(4096, 8);
        write_bytes(&ch, b"data");
        let mut reader = ChannelReader::new();
        let _ = ch.read_map(&mut reader).unwrap();
        let second = ch.read_map(&mut reader).unwrap();
        assert!(second.is_empty());
        assert_eq!(ch.reader_status(&reader), ReaderStatus::ExpectedUnmapped);
    }

    #[test]
    fn ninth_reader_registration_fails() {
        let ch = Channel::new(4096, 8);
        let mut readers: Vec<ChannelReader> = (0..8).map(|_| ChannelReader::new()).collect();
        for r in &mut readers {
            ch.read_map(r).unwrap();
            ch.read_unmap(r, 0);
        }
        let mut ninth = ChannelReader::new();
        assert!(ch.read_map(&mut ninth).is_err());
    }
}

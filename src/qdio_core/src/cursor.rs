/*
Copyright 2026  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use core::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::adapter::QueueId;
use crate::error::{ProtocolViolation, QdioError};

/// Frontier bookkeeping of one queue.
///
/// - `first_to_check`: next slot software has not looked at. Only the engine of
///   the queue's direction moves it, and only forward.
/// - `first_to_kick`: start of the range not yet reported to the handler.
/// - `last_move`: `first_to_check` as of the last pass that saw movement.
/// - `nr_buf_used`: buffers owned by the adapter. Submissions add, engines
///   subtract. It is atomic because both run concurrently.
///
/// All indices are reduced modulo the ring size, which is a power of two.
#[derive(Debug)]
pub struct RingCursor {
    mask: usize,
    first_to_check: AtomicUsize,
    first_to_kick: AtomicUsize,
    last_move: AtomicUsize,
    nr_buf_used: AtomicI32,
}

impl RingCursor {
    /// `buffer_count` must be a power of two.
    pub fn new(buffer_count: usize) -> Self {
        Self {
            mask: buffer_count.max(1) - 1,
            first_to_check: AtomicUsize::new(0),
            first_to_kick: AtomicUsize::new(0),
            last_move: AtomicUsize::new(0),
            nr_buf_used: AtomicI32::new(0),
        }
    }

    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    pub fn mask(&self) -> usize {
        self.mask
    }

    /// `(index + n) mod buffer_count`
    #[inline]
    pub fn add(&self, index: usize, n: usize) -> usize {
        index.wrapping_add(n) & self.mask
    }

    /// `(index - n) mod buffer_count`
    #[inline]
    pub fn sub(&self, index: usize, n: usize) -> usize {
        index.wrapping_sub(n) & self.mask
    }

    #[inline]
    pub fn next(&self, index: usize) -> usize {
        self.add(index, 1)
    }

    #[inline]
    pub fn prev(&self, index: usize) -> usize {
        self.sub(index, 1)
    }

    /// Whether `candidate` lies in the wrapping half-open range
    /// `[start, start + count)`.
    pub fn buf_in_between(&self, candidate: usize, start: usize, count: usize) -> bool {
        if count > self.mask {
            return true;
        }
        self.sub(candidate, start) < count
    }

    #[inline]
    pub fn first_to_check(&self) -> usize {
        self.first_to_check.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_first_to_check(&self, index: usize) {
        self.first_to_check.store(index & self.mask, Ordering::Release)
    }

    #[inline]
    pub fn first_to_kick(&self) -> usize {
        self.first_to_kick.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_first_to_kick(&self, index: usize) {
        self.first_to_kick.store(index & self.mask, Ordering::Release)
    }

    #[inline]
    pub fn last_move(&self) -> usize {
        self.last_move.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_last_move(&self, index: usize) {
        self.last_move.store(index & self.mask, Ordering::Release)
    }

    /// Buffers currently owned by the adapter.
    #[inline]
    pub fn in_flight(&self) -> i32 {
        self.nr_buf_used.load(Ordering::Acquire)
    }

    /// In-flight count clamped to what a frontier scan may look at. One less than
    /// a full ring, so a complete wrap is never mistaken for no movement.
    pub(crate) fn scan_limit(&self) -> usize {
        let used = self.in_flight().max(0) as usize;
        used.min(self.mask)
    }

    /// Hand `n` buffers to the adapter. Returns the count before the update.
    pub(crate) fn claim(&self, queue: QueueId, n: usize) -> Result<i32, QdioError> {
        let n = n as i32;
        let before = self.nr_buf_used.fetch_add(n, Ordering::AcqRel);
        let after = before + n;
        if after > self.buffer_count() as i32 {
            return Err(QdioError::violation(
                queue,
                ProtocolViolation::InFlightOutOfRange {
                    used: after,
                    buffer_count: self.buffer_count(),
                },
            ));
        }
        Ok(before)
    }

    /// Take `n` buffers back from the adapter. Returns the count after the update.
    pub(crate) fn release(&self, queue: QueueId, n: usize) -> Result<i32, QdioError> {
        let n = n as i32;
        let after = self.nr_buf_used.fetch_sub(n, Ordering::AcqRel) - n;
        if after < 0 {
            return Err(QdioError::violation(
                queue,
                ProtocolViolation::InFlightOutOfRange {
                    used: after,
                    buffer_count: self.buffer_count(),
                },
            ));
        }
        Ok(after)
    }
}

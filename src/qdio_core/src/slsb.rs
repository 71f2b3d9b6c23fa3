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

//! Buffer-state storage.
//!
//! Every queue has a state list block (SLSB): one byte per ring slot, shared with
//! the adapter. Whoever owns a slot is the only one allowed to write it; ownership
//! is encoded in the state itself and handed over by the write. There is no lock.
//!
//! Reads and writes go through a [`BufferStateStore`]. The channel picks the
//! implementation once, at establish time:
//!
//! - [`SoftwareStateStore`] touches the shared bytes directly, one atomic exchange
//!   per slot.
//! - [`BatchedStateStore`] issues the adapter's batched extract/set instructions and
//!   keeps retrying while they report partial progress.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering, fence};

use log::{error, trace, warn};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::LOG_TARGET;
use crate::adapter::{Ccq, QdioAdapter, QueueId};
use crate::error::{ProtocolViolation, QdioError};
use crate::queue::Queue;
use crate::stats::PerfEvent;

/// State of one buffer slot.
///
/// Bit 7 marks program ownership, bit 6 control-unit (adapter) ownership, bit 5 an
/// output slot. The low nibble is the state proper.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlsbState {
    InputNotInit = 0x80,
    InputAck = 0x81,
    InputPrimed = 0x82,
    InputHalted = 0x8e,
    InputError = 0x8f,
    CuInputEmpty = 0x41,
    OutputNotInit = 0xa0,
    OutputEmpty = 0xa1,
    OutputPending = 0xa3,
    OutputHalted = 0xae,
    OutputError = 0xaf,
    CuOutputPrimed = 0x62,
}

impl SlsbState {
    pub const OWNER_PROGRAM: u8 = 0x80;
    pub const OWNER_CU: u8 = 0x40;
    pub const TYPE_OUTPUT: u8 = 0x20;

    #[inline]
    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x80 => SlsbState::InputNotInit,
            0x81 => SlsbState::InputAck,
            0x82 => SlsbState::InputPrimed,
            0x8e => SlsbState::InputHalted,
            0x8f => SlsbState::InputError,
            0x41 => SlsbState::CuInputEmpty,
            0xa0 => SlsbState::OutputNotInit,
            0xa1 => SlsbState::OutputEmpty,
            0xa3 => SlsbState::OutputPending,
            0xae => SlsbState::OutputHalted,
            0xaf => SlsbState::OutputError,
            0x62 => SlsbState::CuOutputPrimed,
            _ => return None,
        })
    }

    /// Owned by the adapter, software must not touch it.
    #[inline]
    pub const fn is_cu_owned(self) -> bool {
        self as u8 & Self::OWNER_CU != 0
    }

    #[inline]
    pub const fn is_output(self) -> bool {
        self as u8 & Self::TYPE_OUTPUT != 0
    }

    /// The initial state of a slot on a queue of the given direction.
    pub const fn not_init(is_input: bool) -> Self {
        if is_input {
            SlsbState::InputNotInit
        } else {
            SlsbState::OutputNotInit
        }
    }
}

/// The shared state array of one queue.
#[derive(Debug)]
pub struct Slsb {
    slots: Box<[AtomicU8]>,
    mask: usize,
}

impl Slsb {
    /// `len` must be a power of two.
    pub fn new(len: usize, initial: SlsbState) -> Self {
        let len = len.max(1);
        let slots = (0..len).map(|_| AtomicU8::new(initial.raw())).collect();
        Self {
            slots,
            mask: len - 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read the raw state of a slot. Indices wrap.
    #[inline]
    pub fn load(&self, index: usize) -> u8 {
        self.slots[index & self.mask].load(Ordering::Acquire)
    }

    /// Write the raw state of a slot. Indices wrap.
    #[inline]
    pub fn store(&self, index: usize, raw: u8) {
        self.slots[index & self.mask].store(raw, Ordering::Release)
    }

    /// Exchange the raw state of a slot, returning the previous one.
    #[inline]
    pub fn swap(&self, index: usize, raw: u8) -> u8 {
        self.slots[index & self.mask].swap(raw, Ordering::AcqRel)
    }

    /// Write `count` slots starting at `start`.
    pub fn fill(&self, start: usize, count: usize, raw: u8) {
        for i in 0..count {
            self.store(start.wrapping_add(i), raw);
        }
    }

    /// Length and raw state of the run of equal slots starting at `start`, capped
    /// at `max`.
    pub fn run(&self, start: usize, max: usize) -> (usize, u8) {
        let first = self.load(start);
        let mut n = 1;
        while n < max && self.load(start.wrapping_add(n)) == first {
            n += 1;
        }
        (n.min(max), first)
    }
}

/// A run of contiguous slots sharing one state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateRun {
    pub count: usize,
    pub state: SlsbState,
}

fn decode(queue: QueueId, index: usize, raw: u8) -> Result<SlsbState, QdioError> {
    SlsbState::from_raw(raw).ok_or(QdioError::violation(
        queue,
        ProtocolViolation::UnexpectedState { index, state: raw },
    ))
}

/// Read and write access to the slot states of a queue.
pub trait BufferStateStore: Send + Sync {
    /// The run of slots starting at `start` (wrapping) that share one state, at
    /// most `count` long. `None` when `count` is zero.
    ///
    /// `auto_ack` asks a batched implementation to acknowledge primed input slots
    /// as it extracts them.
    fn get_states(
        &self,
        q: &Queue,
        start: usize,
        count: usize,
        auto_ack: bool,
    ) -> Result<Option<StateRun>, QdioError>;

    /// Set `count` slots starting at `start` to `state`. Returns how many were set.
    fn set_states(
        &self,
        q: &Queue,
        start: usize,
        state: SlsbState,
        count: usize,
    ) -> Result<usize, QdioError>;

    /// Whether this store goes through the adapter's batched instructions.
    fn is_batched(&self) -> bool;

    /// State of a single slot.
    fn get_state(&self, q: &Queue, index: usize) -> Result<SlsbState, QdioError> {
        match self.get_states(q, index, 1, false)? {
            Some(run) => Ok(run.state),
            // the adapter reported nothing, fall back to the shared byte
            None => decode(q.id(), index, q.slsb().load(index)),
        }
    }

    fn set_state(&self, q: &Queue, index: usize, state: SlsbState) -> Result<(), QdioError> {
        self.set_states(q, index, state, 1).map(|_| ())
    }
}

/// Direct access to the shared bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareStateStore;

impl BufferStateStore for SoftwareStateStore {
    fn get_states(
        &self,
        q: &Queue,
        start: usize,
        count: usize,
        _auto_ack: bool,
    ) -> Result<Option<StateRun>, QdioError> {
        if count == 0 {
            return Ok(None);
        }
        let slsb = q.slsb();
        let first = decode(q.id(), start, slsb.load(start))?;
        // the adapter owns it, nothing for us
        if first.is_cu_owned() {
            return Ok(Some(StateRun {
                count: 1,
                state: first,
            }));
        }
        let (n, _) = slsb.run(start, count);
        Ok(Some(StateRun {
            count: n,
            state: first,
        }))
    }

    fn set_states(
        &self,
        q: &Queue,
        start: usize,
        state: SlsbState,
        count: usize,
    ) -> Result<usize, QdioError> {
        let slsb = q.slsb();
        for i in 0..count {
            slsb.swap(start.wrapping_add(i), state.raw());
        }
        // publish the new owner before anything that tells the adapter
        fence(Ordering::SeqCst);
        Ok(count)
    }

    fn is_batched(&self) -> bool {
        false
    }
}

/// Slot access through the adapter's batched extract/set instructions.
pub struct BatchedStateStore {
    adapter: Arc<dyn QdioAdapter>,
    retry_limit: u32,
}

impl BatchedStateStore {
    pub fn new(adapter: Arc<dyn QdioAdapter>, retry_limit: u32) -> Self {
        Self {
            adapter,
            retry_limit,
        }
    }
}

impl core::fmt::Debug for BatchedStateStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchedStateStore")
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

impl BufferStateStore for BatchedStateStore {
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    fn get_states(
        &self,
        q: &Queue,
        start: usize,
        count: usize,
        auto_ack: bool,
    ) -> Result<Option<StateRun>, QdioError> {
        if count == 0 {
            return Ok(None);
        }
        let mut retries = 0;

        loop {
            q.stats().inc(PerfEvent::BatchedExtract);
            let out = self.adapter.extract_states(q.id(), start, count, auto_ack);
            let processed = out.processed.min(count);

            match Ccq::from(out.ccq) {
                Ccq::Done | Ccq::NextStateDiffers => {}
                // Anything extracted may already be acked, so it is handed back
                // now and the caller asks again from the new frontier.
                Ccq::Partial | Ccq::NoneProcessed if processed > 0 => {
                    q.stats().inc(PerfEvent::BatchedExtractPartial);
                    trace!(target: LOG_TARGET, "{:?}: extract partial, {} of {} at {}", q.id(), processed, count, start);
                }
                Ccq::Partial | Ccq::NoneProcessed => {
                    q.stats().inc(PerfEvent::BatchedExtractPartial);
                    retries += 1;
                    if retries > self.retry_limit {
                        error!(target: LOG_TARGET, "{:?}: extract stalled at {} after {} retries", q.id(), start, self.retry_limit);
                        return Err(QdioError::BatchStalled(self.retry_limit));
                    }
                    continue;
                }
                Ccq::Error(ccq) => {
                    error!(target: LOG_TARGET, "{:?}: extract failed, ccq {} start {} count {}", q.id(), ccq, start, count);
                    return Err(QdioError::GetBufState { ccq });
                }
            }

            if processed == 0 {
                return Ok(None);
            }
            return Ok(Some(StateRun {
                count: processed,
                state: decode(q.id(), start, out.state)?,
            }));
        }
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    fn set_states(
        &self,
        q: &Queue,
        start: usize,
        state: SlsbState,
        count: usize,
    ) -> Result<usize, QdioError> {
        if count == 0 {
            return Ok(0);
        }
        let cursor = q.cursor();
        let mut next = start;
        let mut remaining = count;
        let mut retries = 0;

        loop {
            q.stats().inc(PerfEvent::BatchedSet);
            let out = self
                .adapter
                .set_states(q.id(), next, remaining, state.raw());
            let processed = out.processed.min(remaining);
            if processed > 0 {
                remaining -= processed;
                next = cursor.add(next, processed);
                retries = 0;
            }

            match Ccq::from(out.ccq) {
                Ccq::Done | Ccq::NextStateDiffers => break,
                Ccq::Partial | Ccq::NoneProcessed => {
                    if remaining == 0 {
                        break;
                    }
                    q.stats().inc(PerfEvent::BatchedSetPartial);
                    retries += 1;
                    if retries > self.retry_limit {
                        error!(target: LOG_TARGET, "{:?}: set stalled at {} after {} retries", q.id(), next, self.retry_limit);
                        return Err(QdioError::BatchStalled(self.retry_limit));
                    }
                }
                Ccq::Error(ccq) => {
                    error!(target: LOG_TARGET, "{:?}: set failed, ccq {} start {} count {}", q.id(), ccq, start, count);
                    return Err(QdioError::SetBufState { ccq });
                }
            }
        }

        if remaining != 0 {
            warn!(target: LOG_TARGET, "{:?}: set completed {} of {}", q.id(), count - remaining, count);
        }
        Ok(count - remaining)
    }

    fn is_batched(&self) -> bool {
        true
    }
}

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

//! The adapter side of the ring protocol.
//!
//! [`QdioAdapter`] is the narrow interface the engines use to reach the hardware:
//! the control operations that move the channel through its lifecycle, the batched
//! state instructions, the synchronization instruction and the doorbells. All of them
//! are cheap, non-blocking calls; none of them sleeps.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::ControlError;
use crate::slsb::Slsb;

/// Queue direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

/// Identity of a queue on a channel: its direction and its ordinal within that
/// direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId {
    pub direction: Direction,
    pub nr: usize,
}

impl QueueId {
    pub const fn input(nr: usize) -> Self {
        Self {
            direction: Direction::Input,
            nr,
        }
    }

    pub const fn output(nr: usize) -> Self {
        Self {
            direction: Direction::Output,
            nr,
        }
    }

    #[inline]
    pub const fn is_input(&self) -> bool {
        matches!(self.direction, Direction::Input)
    }

    /// Bit selecting this queue in a sync or doorbell mask. Queue 0 is the most
    /// significant bit.
    #[inline]
    pub const fn mask(&self) -> u32 {
        1u32 << (31 - (self.nr as u32 & 31))
    }
}

bitflags! {
    /// What the adapter supports or requires. Negotiated once at establish time.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        /// Slot states are read and written through the batched extract/set
        /// instructions instead of directly.
        const BATCHED_STATE_OPS     = 1 << 0;
        /// A sync instruction has to be issued before a slot read can be trusted.
        const SYNC_BEFORE_READ      = 1 << 1;
        /// One output doorbell covers a whole batch of buffers.
        const MULTI_BUFFER_DOORBELL = 1 << 2;
        /// New output buffers must be announced with a doorbell.
        const OUTPUT_DOORBELL       = 1 << 3;
        /// Freed input buffers must be announced with a doorbell when the adapter
        /// had run dry.
        const INPUT_DOORBELL        = 1 << 4;
        /// The adapter raises interrupts for output completions.
        const OUTPUT_INTERRUPTS     = 1 << 5;
        /// Inbound queues are fully interrupt driven, no time-based polling.
        const NO_INPUT_POLLING      = 1 << 6;
        /// The output doorbell can be skipped while the adapter is still working
        /// on the previous buffer.
        const FAST_REQUEUE          = 1 << 7;
    }
}

/// Completion code of a batched state instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ccq {
    /// Everything requested was processed.
    Done,
    /// Processing stopped because the next slot has a different state.
    NextStateDiffers,
    /// Some slots were processed, not all. Continue from where it stopped.
    Partial,
    /// Nothing was processed. Retry.
    NoneProcessed,
    /// Hard failure.
    Error(u8),
}

impl Ccq {
    pub const DONE: u8 = 0;
    pub const NEXT_STATE_DIFFERS: u8 = 32;
    pub const PARTIAL: u8 = 96;
    pub const NONE_PROCESSED: u8 = 97;
}

impl From<u8> for Ccq {
    fn from(ccq: u8) -> Self {
        match ccq {
            Ccq::DONE => Ccq::Done,
            Ccq::NEXT_STATE_DIFFERS => Ccq::NextStateDiffers,
            Ccq::PARTIAL => Ccq::Partial,
            Ccq::NONE_PROCESSED => Ccq::NoneProcessed,
            other => Ccq::Error(other),
        }
    }
}

/// Result of one batched extract or set instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchOutcome {
    pub ccq: u8,
    /// Slots processed by this call. They always share one state.
    pub processed: usize,
    /// Raw state of the processed slots (extract only).
    pub state: u8,
}

impl BatchOutcome {
    pub const fn new(ccq: u8, processed: usize, state: u8) -> Self {
        Self {
            ccq,
            processed,
            state,
        }
    }
}

/// Condition code of a signal-adapter instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SigaOutcome {
    pub cc: u8,
    /// Set together with cc 2 when the adapter was only transiently busy.
    pub busy: bool,
}

impl SigaOutcome {
    pub const OK: Self = Self { cc: 0, busy: false };
    pub const BUSY: Self = Self { cc: 2, busy: true };

    pub const fn failed(cc: u8) -> Self {
        Self { cc, busy: false }
    }

    #[inline]
    pub const fn is_busy(&self) -> bool {
        self.cc == 2 && self.busy
    }
}

/// What the channel hands to the adapter when establishing: the ring size and the
/// state arrays of every queue.
#[derive(Debug, Clone)]
pub struct EstablishRequest {
    pub buffer_count: usize,
    pub input: Vec<Arc<Slsb>>,
    pub output: Vec<Arc<Slsb>>,
}

/// What the adapter reports back from a successful establish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub capabilities: Capabilities,
    /// Largest ring the adapter accepts.
    pub max_buffers: usize,
}

/// The hardware (or firmware, or simulator) end of a channel.
pub trait QdioAdapter: Send + Sync {
    /// Hand the queue state arrays to the adapter and query its capabilities.
    fn establish(&self, request: &EstablishRequest) -> Result<AdapterInfo, ControlError>;

    /// Start data transfer.
    fn activate(&self) -> Result<(), ControlError>;

    /// Stop all data transfer. The adapter must not touch any state array after
    /// this returns.
    fn halt(&self);

    /// Batched extract of up to `count` slot states starting at `start`. With
    /// `auto_ack`, primed input slots are moved to the acknowledged state as they
    /// are extracted.
    fn extract_states(
        &self,
        queue: QueueId,
        start: usize,
        count: usize,
        auto_ack: bool,
    ) -> BatchOutcome;

    /// Batched set of `count` slots starting at `start` to `state`.
    fn set_states(&self, queue: QueueId, start: usize, count: usize, state: u8) -> BatchOutcome;

    /// Synchronize the adapter's view of the queues selected by the two masks.
    /// Returns the condition code.
    fn sync(&self, output_mask: u32, input_mask: u32) -> u8;

    /// Output doorbell for `buffers` newly primed buffers.
    fn signal_output(&self, queue: QueueId, buffers: usize) -> SigaOutcome;

    /// Input doorbell. Returns the condition code.
    fn signal_input(&self, queue: QueueId) -> u8;
}

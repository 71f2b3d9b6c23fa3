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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Queued direct I/O ring engine.
//!
//! A channel owns a small number of inbound and outbound queues. Every queue is a
//! fixed-size ring of buffer slots whose one-byte states are shared with an adapter
//! that fills inbound buffers and drains outbound ones asynchronously. Software only
//! ever moves a queue's frontier forward over slots the adapter handed back, and
//! reports each contiguous range it consumed to the upper layer exactly once.
//!
//! # Layers
//!
//! - [`BufferStateStore`]: reads and writes runs of slot states, either straight from
//!   the shared state array ([`SoftwareStateStore`]) or through the adapter's batched
//!   instructions ([`BatchedStateStore`]). The channel picks one at establish time.
//! - [`RingCursor`]: frontier bookkeeping and wraparound arithmetic.
//! - [`InboundEngine`] / [`OutboundEngine`]: advance the frontier of one queue and
//!   handle submissions from the upper layer.
//! - [`SyncPrimitive`]: the "synchronize shared state" instruction some adapters need
//!   before a slot read can be trusted.
//! - [`Tasklet`] / [`QueueTimer`]: per-queue deferred work, driven by
//!   [`Channel::run_pending`] and [`Channel::run_timers`].
//! - [`IrqStateMachine`]: gates every engine pass on the channel state.
//!
//! # Example
//!
//! ```ignore
//! let channel = Channel::establish(config, adapter, clock, input_handler, output_handler)?;
//! channel.activate()?;
//!
//! // hand buffers 0..16 of input queue 0 to the adapter
//! channel.submit(SubmitFlags::INPUT, 0, 0, 16)?;
//!
//! // from the interrupt path
//! channel.on_interrupt();
//! // from the deferred-work path
//! channel.poll();
//! ```

extern crate alloc;

/// Adapter-facing interface: queue identities, capabilities and the instructions
/// the engines issue.
pub mod adapter;
/// Channel lifecycle and the upper-layer submission entry point.
pub mod channel;
/// Injectable time source.
pub mod clock;
/// Channel configuration and its limits.
pub mod config;
/// Error types and sticky error flags.
pub mod error;
/// Upper-layer completion callback.
pub mod handler;
/// Inbound frontier engine.
pub mod inbound;
/// Channel state machine.
pub mod irq;
/// Outbound frontier engine and doorbell.
pub mod outbound;
/// A single queue and its shared state.
pub mod queue;
/// Per-queue deferred work and the processing passes it runs.
pub mod scheduler;
/// Buffer-state storage and the state encoding.
pub mod slsb;
/// Per-queue counters.
pub mod stats;
/// Adapter synchronization instruction.
pub mod sync;

mod cursor;

#[cfg(test)]
pub(crate) mod testutil;

pub use adapter::{
    AdapterInfo, BatchOutcome, Capabilities, Ccq, Direction, EstablishRequest, QdioAdapter,
    QueueId, SigaOutcome,
};
pub use channel::{Channel, SubmitFlags};
#[cfg(feature = "std")]
pub use clock::MonotonicClock;
pub use clock::Clock;
pub use config::ChannelConfiguration;
pub use cursor::RingCursor;
pub use error::{ControlError, ErrorFlags, ProtocolViolation, QdioError};
pub use handler::QueueHandler;
pub use inbound::InboundEngine;
pub use irq::{IrqState, IrqStateMachine};
pub use outbound::OutboundEngine;
pub use queue::{EngineContext, EngineState, Queue};
pub use scheduler::{QueueTimer, Tasklet};
pub use slsb::{
    BatchedStateStore, BufferStateStore, Slsb, SlsbState, SoftwareStateStore, StateRun,
};
pub use stats::{PerfCounters, PerfEvent, QueueStats};
pub use sync::SyncPrimitive;

/// Largest ring a queue can have.
pub const MAX_BUFFERS_PER_QUEUE: usize = 128;
/// Mask applied to ring indices of a maximum-size queue.
pub const MAX_BUFFERS_MASK: usize = MAX_BUFFERS_PER_QUEUE - 1;
/// Largest number of queues per direction on one channel.
pub const MAX_QUEUES_PER_DIRECTION: usize = 4;

/// Target used by every log record this crate emits.
pub(crate) const LOG_TARGET: &str = "qdio";

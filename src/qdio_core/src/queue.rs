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

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::time::Duration;

use crate::adapter::{Capabilities, QdioAdapter, QueueId};
use crate::clock::Clock;
use crate::config::ChannelConfiguration;
use crate::cursor::RingCursor;
use crate::error::ErrorFlags;
use crate::scheduler::{QueueTimer, Tasklet};
use crate::slsb::{BufferStateStore, Slsb, SlsbState};
use crate::stats::{PerfCounters, QueueStats};
use crate::sync::SyncPrimitive;

/// Inbound acknowledgement bookkeeping.
///
/// While polling, `count` slots starting at `start` are held in the acknowledged
/// state (software path: exactly one, the newest consumed slot). Only held for
/// short, non-reentrant sections, never across a handler callout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct AckState {
    pub(crate) polling: bool,
    pub(crate) start: usize,
    pub(crate) count: usize,
}

/// State owned by whoever holds a queue's run lock.
#[derive(Debug, Default)]
pub struct EngineState {
    /// When the inbound frontier last moved.
    pub(crate) timestamp: Duration,
}

/// One direction of one logical channel: a ring of slots shared with the adapter
/// and everything software tracks about it.
#[derive(Debug)]
pub struct Queue {
    id: QueueId,
    slsb: Arc<Slsb>,
    cursor: RingCursor,
    errors: AtomicU32,
    pub(crate) ack: spin::Mutex<AckState>,
    engine: spin::Mutex<EngineState>,
    pci_out_enabled: AtomicBool,
    tasklet: Tasklet,
    timer: QueueTimer,
    stats: PerfCounters,
}

impl Queue {
    /// A queue of `buffer_count` slots, all in the not-initialized state.
    pub fn new(id: QueueId, buffer_count: usize) -> Self {
        Self {
            id,
            slsb: Arc::new(Slsb::new(
                buffer_count,
                SlsbState::not_init(id.is_input()),
            )),
            cursor: RingCursor::new(buffer_count),
            errors: AtomicU32::new(0),
            ack: spin::Mutex::new(AckState::default()),
            engine: spin::Mutex::new(EngineState::default()),
            pci_out_enabled: AtomicBool::new(false),
            tasklet: Tasklet::new(),
            timer: QueueTimer::new(),
            stats: PerfCounters::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    #[inline]
    pub fn slsb(&self) -> &Arc<Slsb> {
        &self.slsb
    }

    #[inline]
    pub fn cursor(&self) -> &RingCursor {
        &self.cursor
    }

    #[inline]
    pub fn stats(&self) -> &PerfCounters {
        &self.stats
    }

    #[inline]
    pub fn tasklet(&self) -> &Tasklet {
        &self.tasklet
    }

    #[inline]
    pub fn timer(&self) -> &QueueTimer {
        &self.timer
    }

    /// Record sticky error flags for the next handler callout.
    pub fn raise(&self, flags: ErrorFlags) {
        self.errors.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn errors(&self) -> ErrorFlags {
        ErrorFlags::from_bits_retain(self.errors.load(Ordering::Acquire))
    }

    pub fn has_errors(&self) -> bool {
        self.errors.load(Ordering::Acquire) != 0
    }

    /// Read and clear the sticky error flags.
    pub(crate) fn take_errors(&self) -> ErrorFlags {
        ErrorFlags::from_bits_retain(self.errors.swap(0, Ordering::AcqRel))
    }

    /// Whether the last outbound submit asked for a completion interrupt.
    pub fn pci_out_enabled(&self) -> bool {
        self.pci_out_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_pci_out_enabled(&self, enabled: bool) {
        self.pci_out_enabled.store(enabled, Ordering::Release)
    }

    pub fn is_polling(&self) -> bool {
        self.ack.lock().polling
    }

    /// Schedule this queue's processing pass.
    pub fn schedule(&self) -> bool {
        self.tasklet.schedule()
    }

    /// Take the run lock unless a pass is already running.
    pub(crate) fn try_run(&self) -> Option<spin::MutexGuard<'_, EngineState>> {
        self.engine.try_lock()
    }

    /// Wait for a running pass to finish.
    pub(crate) fn drain(&self) {
        drop(self.engine.lock());
    }

    pub fn snapshot(&self) -> QueueStats {
        let in_flight = self.cursor.in_flight().max(0) as usize;
        QueueStats {
            in_flight,
            free: self.cursor.buffer_count().saturating_sub(in_flight),
            first_to_check: self.cursor.first_to_check(),
            first_to_kick: self.cursor.first_to_kick(),
            polling: self.is_polling(),
        }
    }
}

/// Everything an engine needs from the channel besides the queue itself.
#[derive(Clone, Copy)]
pub struct EngineContext<'a> {
    pub capabilities: Capabilities,
    pub config: &'a ChannelConfiguration,
    pub store: &'a dyn BufferStateStore,
    pub sync: &'a SyncPrimitive,
    pub adapter: &'a dyn QdioAdapter,
    pub clock: &'a dyn Clock,
}

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

use core::sync::atomic::{AtomicU64, Ordering};

/// Events counted per queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum PerfEvent {
    /// Handler callouts with a buffer range.
    HandlerCall,
    /// Processing passes that got past the run lock.
    TaskletRun,
    /// Passes that scheduled themselves again.
    TaskletResched,
    /// Output doorbell instructions.
    SigaWrite,
    /// Input doorbell instructions.
    SigaRead,
    /// Sync instructions.
    SigaSync,
    BatchedExtract,
    BatchedExtractPartial,
    BatchedSet,
    BatchedSetPartial,
    StopPolling,
    /// Output doorbells skipped because the adapter was still busy with the
    /// previous buffer.
    FastRequeue,
    /// Outbound: a submit put the whole ring in flight. Inbound: a pass took
    /// back the adapter's last free buffer.
    QueueFull,
    /// Runs of slots in the error state.
    ErrorRun,
    /// Runs that meant nothing new.
    NopRun,
    /// Buffers taken back from the adapter.
    BuffersProcessed,
    /// Upper-layer submissions.
    Submit,
}

impl PerfEvent {
    pub const COUNT: usize = PerfEvent::Submit as usize + 1;
}

/// Per-queue event counters.
#[derive(Debug, Default)]
pub struct PerfCounters {
    counters: [AtomicU64; PerfEvent::COUNT],
}

impl PerfCounters {
    #[inline]
    pub fn inc(&self, event: PerfEvent) {
        self.add(event, 1);
    }

    #[inline]
    pub fn add(&self, event: PerfEvent, n: u64) {
        self.counters[event as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, event: PerfEvent) -> u64 {
        self.counters[event as usize].load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Buffers owned by the adapter.
    pub in_flight: usize,
    /// Buffers owned by software.
    pub free: usize,
    pub first_to_check: usize,
    pub first_to_kick: usize,
    /// Inbound only: an acknowledgement is outstanding.
    pub polling: bool,
}

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

//! In-crate test doubles for unit tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use crate::adapter::{
    AdapterInfo, BatchOutcome, Capabilities, Ccq, EstablishRequest, QdioAdapter, QueueId,
    SigaOutcome,
};
use crate::channel::Channel;
use crate::clock::Clock;
use crate::config::ChannelConfiguration;
use crate::error::{ControlError, ErrorFlags};
use crate::handler::QueueHandler;
use crate::queue::{EngineContext, Queue};
use crate::slsb::{BatchedStateStore, BufferStateStore, Slsb, SlsbState, SoftwareStateStore};
use crate::sync::SyncPrimitive;

#[derive(Debug, Default)]
pub(crate) struct TestClock {
    nanos: AtomicU64,
}

impl TestClock {
    pub(crate) fn advance(&self, by: Duration) {
        self.nanos.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Adapter backed directly by the queues' state arrays.
#[derive(Default)]
pub(crate) struct TestAdapter {
    caps: Capabilities,
    input: spin::Mutex<Vec<Arc<Slsb>>>,
    output: spin::Mutex<Vec<Arc<Slsb>>>,
    chunk: AtomicUsize,
    fail_ccq: AtomicU8,
    stall: AtomicBool,
    boundary_partial: AtomicBool,
    sync_cc: AtomicU8,
    syncs: spin::Mutex<Vec<(u32, u32)>>,
    busy: AtomicU32,
    siga_cc: AtomicU8,
    output_signals: spin::Mutex<Vec<(QueueId, usize)>>,
    input_signals: AtomicUsize,
    clock: spin::Mutex<Option<(Arc<TestClock>, Duration)>>,
    halted: AtomicBool,
}

impl TestAdapter {
    pub(crate) fn new(caps: Capabilities) -> Self {
        Self {
            caps,
            ..Default::default()
        }
    }

    pub(crate) fn attach(&self, q: &Queue) {
        let mut list = if q.id().is_input() {
            self.input.lock()
        } else {
            self.output.lock()
        };
        while list.len() <= q.id().nr {
            list.push(Arc::new(Slsb::new(1, SlsbState::InputNotInit)));
        }
        list[q.id().nr] = q.slsb().clone();
    }

    fn slsb(&self, id: QueueId) -> Arc<Slsb> {
        let list = if id.is_input() {
            self.input.lock()
        } else {
            self.output.lock()
        };
        list[id.nr].clone()
    }

    /// Batched calls process at most `n` slots and report partial progress.
    pub(crate) fn set_batch_chunk(&self, n: usize) {
        self.chunk.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_batched(&self, ccq: u8) {
        self.fail_ccq.store(ccq, Ordering::SeqCst);
    }

    /// The next extract that stops at a state change reports partial progress
    /// instead.
    pub(crate) fn partial_at_next_boundary(&self) {
        self.boundary_partial.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stall_batched(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_sync_cc(&self, cc: u8) {
        self.sync_cc.store(cc, Ordering::SeqCst);
    }

    pub(crate) fn syncs(&self) -> Vec<(u32, u32)> {
        self.syncs.lock().clone()
    }

    /// The next `n` output doorbells report busy.
    pub(crate) fn set_busy(&self, n: u32) {
        self.busy.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_siga_cc(&self, cc: u8) {
        self.siga_cc.store(cc, Ordering::SeqCst);
    }

    pub(crate) fn output_signals(&self) -> Vec<(QueueId, usize)> {
        self.output_signals.lock().clone()
    }

    pub(crate) fn input_signals(&self) -> usize {
        self.input_signals.load(Ordering::SeqCst)
    }

    /// Every output doorbell advances `clock` by `step`.
    pub(crate) fn tick_clock(&self, clock: Arc<TestClock>, step: Duration) {
        *self.clock.lock() = Some((clock, step));
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }
}

impl QdioAdapter for TestAdapter {
    fn establish(&self, request: &EstablishRequest) -> Result<AdapterInfo, ControlError> {
        *self.input.lock() = request.input.clone();
        *self.output.lock() = request.output.clone();
        Ok(AdapterInfo {
            capabilities: self.caps,
            max_buffers: crate::MAX_BUFFERS_PER_QUEUE,
        })
    }

    fn activate(&self) -> Result<(), ControlError> {
        Ok(())
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    fn extract_states(
        &self,
        queue: QueueId,
        start: usize,
        count: usize,
        auto_ack: bool,
    ) -> BatchOutcome {
        if self.stall.load(Ordering::SeqCst) {
            return BatchOutcome::new(Ccq::NONE_PROCESSED, 0, 0);
        }
        match self.fail_ccq.load(Ordering::SeqCst) {
            0 => {}
            ccq => return BatchOutcome::new(ccq, 0, 0),
        }
        let slsb = self.slsb(queue);
        let (run, raw) = slsb.run(start, count);
        let chunk = self.chunk.load(Ordering::SeqCst);
        let (processed, ccq) = if chunk != 0 && run > chunk {
            (chunk, Ccq::PARTIAL)
        } else if run == count {
            (run, Ccq::DONE)
        } else if self.boundary_partial.swap(false, Ordering::SeqCst) {
            (run, Ccq::PARTIAL)
        } else {
            (run, Ccq::NEXT_STATE_DIFFERS)
        };
        if auto_ack && raw == SlsbState::InputPrimed.raw() {
            slsb.fill(start, processed, SlsbState::InputAck.raw());
        }
        BatchOutcome::new(ccq, processed, raw)
    }

    fn set_states(&self, queue: QueueId, start: usize, count: usize, state: u8) -> BatchOutcome {
        if self.stall.load(Ordering::SeqCst) {
            return BatchOutcome::new(Ccq::NONE_PROCESSED, 0, 0);
        }
        match self.fail_ccq.load(Ordering::SeqCst) {
            0 => {}
            ccq => return BatchOutcome::new(ccq, 0, 0),
        }
        let chunk = self.chunk.load(Ordering::SeqCst);
        let processed = if chunk != 0 { count.min(chunk) } else { count };
        self.slsb(queue).fill(start, processed, state);
        let ccq = if processed < count {
            Ccq::PARTIAL
        } else {
            Ccq::DONE
        };
        BatchOutcome::new(ccq, processed, state)
    }

    fn sync(&self, output_mask: u32, input_mask: u32) -> u8 {
        self.syncs.lock().push((output_mask, input_mask));
        self.sync_cc.load(Ordering::SeqCst)
    }

    fn signal_output(&self, queue: QueueId, buffers: usize) -> SigaOutcome {
        self.output_signals.lock().push((queue, buffers));
        if let Some((clock, step)) = self.clock.lock().as_ref() {
            clock.advance(*step);
        }
        let busy = self.busy.load(Ordering::SeqCst);
        if busy > 0 {
            self.busy.store(busy - 1, Ordering::SeqCst);
            return SigaOutcome::BUSY;
        }
        match self.siga_cc.load(Ordering::SeqCst) {
            0 => SigaOutcome::OK,
            cc => SigaOutcome::failed(cc),
        }
    }

    fn signal_input(&self, _queue: QueueId) -> u8 {
        self.input_signals.fetch_add(1, Ordering::SeqCst);
        0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Call {
    pub(crate) queue: QueueId,
    pub(crate) errors: ErrorFlags,
    pub(crate) first: Option<usize>,
    pub(crate) count: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Recorder {
    calls: spin::Mutex<Vec<Call>>,
}

impl Recorder {
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl QueueHandler for Recorder {
    fn on_buffers(&self, queue: QueueId, errors: ErrorFlags, first: Option<usize>, count: usize) {
        self.calls.lock().push(Call {
            queue,
            errors,
            first,
            count,
        });
    }
}

/// Engine dependencies for a single queue, without a channel.
pub(crate) struct Harness {
    pub(crate) caps: Capabilities,
    pub(crate) config: ChannelConfiguration,
    pub(crate) adapter: Arc<TestAdapter>,
    pub(crate) clock: Arc<TestClock>,
    pub(crate) store: Box<dyn BufferStateStore>,
    pub(crate) sync: SyncPrimitive,
    pub(crate) queue: Queue,
}

impl Harness {
    pub(crate) fn new(caps: Capabilities, id: QueueId, buffer_count: usize) -> Self {
        let mut config = ChannelConfiguration::default();
        config.set_buffer_count(buffer_count);
        let adapter = Arc::new(TestAdapter::new(caps));
        let queue = Queue::new(id, config.buffer_count());
        adapter.attach(&queue);
        let store: Box<dyn BufferStateStore> = if caps.contains(Capabilities::BATCHED_STATE_OPS) {
            Box::new(BatchedStateStore::new(adapter.clone(), config.batch_retry_limit()))
        } else {
            Box::new(SoftwareStateStore)
        };
        Self {
            caps,
            config,
            sync: SyncPrimitive::new(adapter.clone(), caps),
            adapter,
            clock: Arc::new(TestClock::default()),
            store,
            queue,
        }
    }

    pub(crate) fn ctx(&self) -> EngineContext<'_> {
        EngineContext {
            capabilities: self.caps,
            config: &self.config,
            store: self.store.as_ref(),
            sync: &self.sync,
            adapter: self.adapter.as_ref(),
            clock: self.clock.as_ref(),
        }
    }

    /// Software hands `count` buffers at `start` to the adapter.
    pub(crate) fn give(&self, start: usize, count: usize, state: SlsbState) {
        self.queue.slsb().fill(start, count, state.raw());
        self.queue.cursor().claim(self.queue.id(), count).unwrap();
    }

    /// The adapter hands slots back.
    pub(crate) fn hw(&self, start: usize, count: usize, state: SlsbState) {
        self.queue.slsb().fill(start, count, state.raw());
    }

    pub(crate) fn state(&self, index: usize) -> u8 {
        self.queue.slsb().load(index)
    }
}

/// An active channel with one inbound and one outbound queue.
pub(crate) struct TestChannel {
    pub(crate) adapter: Arc<TestAdapter>,
    pub(crate) clock: Arc<TestClock>,
    pub(crate) input: Arc<Recorder>,
    pub(crate) output: Arc<Recorder>,
    pub(crate) channel: Channel,
}

impl TestChannel {
    pub(crate) fn new(caps: Capabilities, buffer_count: usize) -> Self {
        let mut config = ChannelConfiguration::new(1, 1);
        config.set_buffer_count(buffer_count);
        Self::with_config(caps, config)
    }

    pub(crate) fn with_config(caps: Capabilities, config: ChannelConfiguration) -> Self {
        let adapter = Arc::new(TestAdapter::new(caps));
        let clock = Arc::new(TestClock::default());
        let input = Arc::new(Recorder::default());
        let output = Arc::new(Recorder::default());
        let channel = Channel::establish(
            config,
            adapter.clone(),
            clock.clone(),
            input.clone(),
            output.clone(),
        )
        .unwrap();
        channel.activate().unwrap();
        Self {
            adapter,
            clock,
            input,
            output,
            channel,
        }
    }

    pub(crate) fn inq(&self) -> &Queue {
        self.channel.queue(QueueId::input(0)).unwrap()
    }

    pub(crate) fn outq(&self) -> &Queue {
        self.channel.queue(QueueId::output(0)).unwrap()
    }
}

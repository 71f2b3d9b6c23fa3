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
//! The hardware side of a channel.
//!
//! [`SimulatedAdapter`] keeps the state arrays handed over at establish time and
//! lets a test act as the adapter: fill inbound buffers, drain outbound ones,
//! flag errors, or make the instructions the engines issue fail.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use qdio_core::{
    AdapterInfo, BatchOutcome, Capabilities, Ccq, ControlError, EstablishRequest,
    MAX_BUFFERS_PER_QUEUE, QdioAdapter, QueueId, SigaOutcome, Slsb, SlsbState,
};

use crate::ManualClock;

#[derive(Default)]
struct Ring {
    slsb: Option<Arc<Slsb>>,
    /// Next slot the adapter fills or drains.
    next: usize,
}

#[derive(Default)]
struct SimState {
    input: Vec<Ring>,
    output: Vec<Ring>,
    max_buffers: usize,
    establish_error: Option<ControlError>,
    activate_error: Option<ControlError>,
    busy: u32,
    doorbell_cc: u8,
    sync_cc: u8,
    batch_chunk: usize,
    batch_ccq: Option<u8>,
    batch_stalled: bool,
    output_doorbells: Vec<(QueueId, usize)>,
    input_doorbells: usize,
    syncs: usize,
    extracts: usize,
    halted: bool,
    tick: Option<(Arc<ManualClock>, Duration)>,
}

/// Adapter double backed by the channel's own state arrays.
pub struct SimulatedAdapter {
    capabilities: Capabilities,
    state: Mutex<SimState>,
}

impl SimulatedAdapter {
    pub fn new(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(SimState {
                max_buffers: MAX_BUFFERS_PER_QUEUE,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slsb(&self, id: QueueId) -> Arc<Slsb> {
        let st = self.lock();
        let rings = if id.is_input() { &st.input } else { &st.output };
        rings
            .get(id.nr)
            .and_then(|r| r.slsb.clone())
            .unwrap_or_else(|| panic!("{:?} was not established", id))
    }

    // hardware side

    /// Mark `count` slots from `start` as filled with data.
    pub fn fill_input(&self, nr: usize, start: usize, count: usize) {
        self.slsb(QueueId::input(nr))
            .fill(start, count, SlsbState::InputPrimed.raw());
    }

    /// Mark `count` slots from `start` as transmitted.
    pub fn complete_output(&self, nr: usize, start: usize, count: usize) {
        self.slsb(QueueId::output(nr))
            .fill(start, count, SlsbState::OutputEmpty.raw());
    }

    /// Mark one slot as failed by the adapter.
    pub fn fail_buffer(&self, id: QueueId, index: usize) {
        let state = if id.is_input() {
            SlsbState::InputError
        } else {
            SlsbState::OutputError
        };
        self.slsb(id).store(index, state.raw());
    }

    /// Write any byte, including ones that are not a valid state.
    pub fn set_raw(&self, id: QueueId, index: usize, raw: u8) {
        self.slsb(id).store(index, raw);
    }

    pub fn state(&self, id: QueueId, index: usize) -> u8 {
        self.slsb(id).load(index)
    }

    /// Fill up to `max` empty inbound buffers in ring order, the way the adapter
    /// would as data arrives. Returns how many were filled.
    pub fn produce_input(&self, nr: usize, max: usize) -> usize {
        self.advance(QueueId::input(nr), max, SlsbState::CuInputEmpty, SlsbState::InputPrimed)
    }

    /// Transmit up to `max` primed outbound buffers in ring order. Returns how
    /// many were drained.
    pub fn drain_output(&self, nr: usize, max: usize) -> usize {
        self.advance(QueueId::output(nr), max, SlsbState::CuOutputPrimed, SlsbState::OutputEmpty)
    }

    /// Fail the next empty inbound buffer instead of filling it.
    pub fn fail_next_input(&self, nr: usize) -> bool {
        self.advance(QueueId::input(nr), 1, SlsbState::CuInputEmpty, SlsbState::InputError) == 1
    }

    /// Fail the next primed outbound buffer instead of transmitting it.
    pub fn fail_next_output(&self, nr: usize) -> bool {
        self.advance(QueueId::output(nr), 1, SlsbState::CuOutputPrimed, SlsbState::OutputError) == 1
    }

    fn advance(&self, id: QueueId, max: usize, from: SlsbState, to: SlsbState) -> usize {
        let mut st = self.lock();
        let rings = if id.is_input() {
            &mut st.input
        } else {
            &mut st.output
        };
        let Some(ring) = rings.get_mut(id.nr) else {
            return 0;
        };
        let Some(slsb) = ring.slsb.clone() else {
            return 0;
        };
        let mut done = 0;
        while done < max && slsb.load(ring.next) == from.raw() {
            slsb.store(ring.next, to.raw());
            ring.next = (ring.next + 1) % slsb.len();
            done += 1;
        }
        done
    }

    // fault injection

    pub fn fail_establish(&self, err: ControlError) {
        self.lock().establish_error = Some(err);
    }

    pub fn fail_activate(&self, err: ControlError) {
        self.lock().activate_error = Some(err);
    }

    pub fn set_max_buffers(&self, max: usize) {
        self.lock().max_buffers = max;
    }

    /// The next `n` output doorbells report busy.
    pub fn set_busy(&self, n: u32) {
        self.lock().busy = n;
    }

    pub fn set_doorbell_cc(&self, cc: u8) {
        self.lock().doorbell_cc = cc;
    }

    pub fn set_sync_cc(&self, cc: u8) {
        self.lock().sync_cc = cc;
    }

    /// Batched instructions process at most `n` slots per call.
    pub fn set_batch_chunk(&self, n: usize) {
        self.lock().batch_chunk = n;
    }

    /// Batched instructions fail with `ccq`.
    pub fn fail_batched(&self, ccq: Option<u8>) {
        self.lock().batch_ccq = ccq;
    }

    /// Batched instructions make no progress.
    pub fn stall_batched(&self, stalled: bool) {
        self.lock().batch_stalled = stalled;
    }

    /// Every output doorbell advances `clock` by `step`, so busy retries make
    /// progress against a clock nobody else moves.
    pub fn tick_on_doorbell(&self, clock: Arc<ManualClock>, step: Duration) {
        self.lock().tick = Some((clock, step));
    }

    // observation

    pub fn output_doorbells(&self) -> Vec<(QueueId, usize)> {
        self.lock().output_doorbells.clone()
    }

    pub fn input_doorbells(&self) -> usize {
        self.lock().input_doorbells
    }

    pub fn syncs(&self) -> usize {
        self.lock().syncs
    }

    pub fn extracts(&self) -> usize {
        self.lock().extracts
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    fn batch_fault(&self) -> Option<BatchOutcome> {
        let st = self.lock();
        if st.batch_stalled {
            return Some(BatchOutcome::new(Ccq::NONE_PROCESSED, 0, 0));
        }
        st.batch_ccq.map(|ccq| BatchOutcome::new(ccq, 0, 0))
    }
}

impl QdioAdapter for SimulatedAdapter {
    fn establish(&self, request: &EstablishRequest) -> Result<AdapterInfo, ControlError> {
        let mut st = self.lock();
        if let Some(err) = st.establish_error.take() {
            return Err(err);
        }
        let ring = |slsb: &Arc<Slsb>| Ring {
            slsb: Some(slsb.clone()),
            next: 0,
        };
        st.input = request.input.iter().map(ring).collect();
        st.output = request.output.iter().map(ring).collect();
        st.halted = false;
        Ok(AdapterInfo {
            capabilities: self.capabilities,
            max_buffers: st.max_buffers,
        })
    }

    fn activate(&self) -> Result<(), ControlError> {
        match self.lock().activate_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn halt(&self) {
        self.lock().halted = true;
    }

    fn extract_states(
        &self,
        queue: QueueId,
        start: usize,
        count: usize,
        auto_ack: bool,
    ) -> BatchOutcome {
        self.lock().extracts += 1;
        if let Some(fault) = self.batch_fault() {
            return fault;
        }
        let slsb = self.slsb(queue);
        let (run, raw) = slsb.run(start, count);
        let chunk = self.lock().batch_chunk;
        let (processed, ccq) = if chunk != 0 && run > chunk {
            (chunk, Ccq::PARTIAL)
        } else if run == count {
            (run, Ccq::DONE)
        } else {
            (run, Ccq::NEXT_STATE_DIFFERS)
        };
        if auto_ack && raw == SlsbState::InputPrimed.raw() {
            slsb.fill(start, processed, SlsbState::InputAck.raw());
        }
        BatchOutcome::new(ccq, processed, raw)
    }

    fn set_states(&self, queue: QueueId, start: usize, count: usize, state: u8) -> BatchOutcome {
        if let Some(fault) = self.batch_fault() {
            return fault;
        }
        let chunk = self.lock().batch_chunk;
        let processed = if chunk != 0 { count.min(chunk) } else { count };
        self.slsb(queue).fill(start, processed, state);
        let ccq = if processed < count {
            Ccq::PARTIAL
        } else {
            Ccq::DONE
        };
        BatchOutcome::new(ccq, processed, state)
    }

    fn sync(&self, _output_mask: u32, _input_mask: u32) -> u8 {
        let mut st = self.lock();
        st.syncs += 1;
        st.sync_cc
    }

    fn signal_output(&self, queue: QueueId, buffers: usize) -> SigaOutcome {
        let mut st = self.lock();
        st.output_doorbells.push((queue, buffers));
        if let Some((clock, step)) = st.tick.as_ref() {
            clock.advance(*step);
        }
        if st.busy > 0 {
            st.busy -= 1;
            return SigaOutcome::BUSY;
        }
        match st.doorbell_cc {
            0 => SigaOutcome::OK,
            cc => SigaOutcome::failed(cc),
        }
    }

    fn signal_input(&self, _queue: QueueId) -> u8 {
        self.lock().input_doorbells += 1;
        0
    }
}

impl std::fmt::Debug for SimulatedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedAdapter")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

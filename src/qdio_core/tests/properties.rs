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
//! Randomized submit / adapter / interrupt / timer interleavings checked against
//! the ring invariants.

mod common;

use std::time::Duration;

use common::{IN, OUT, Rig, assert_contiguous};
use qdio_core::{Capabilities, IrqState, SlsbState, StateRun, SubmitFlags};
use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

const MAX_OPS: usize = 96;

#[derive(Clone, Debug)]
enum Op {
    /// return up to N owned inbound buffers to the adapter
    SubmitIn(u8),
    /// queue up to N outbound buffers
    SubmitOut(u8),
    /// adapter fills up to N inbound buffers
    Produce(u8),
    /// adapter transmits up to N outbound buffers
    Drain(u8),
    Interrupt,
    /// clock moves N * 100us
    Tick(u8),
    Poll,
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 7 {
            0 => Op::SubmitIn(u8::arbitrary(g)),
            1 => Op::SubmitOut(u8::arbitrary(g)),
            2 => Op::Produce(u8::arbitrary(g)),
            3 => Op::Drain(u8::arbitrary(g)),
            4 => Op::Interrupt,
            5 => Op::Tick(u8::arbitrary(g)),
            6 => Op::Poll,
            _ => unreachable!(),
        }
    }
}

#[derive(Clone, Debug)]
struct Scenario {
    buffer_count: usize,
    caps: Capabilities,
    ops: Vec<Op>,
}

impl Arbitrary for Scenario {
    fn arbitrary(g: &mut Gen) -> Self {
        let buffer_count = *g.choose(&[2usize, 4, 8, 16, 32]).unwrap();
        let caps = Capabilities::from_bits_truncate(u32::arbitrary(g));
        let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
        let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();
        Scenario {
            buffer_count,
            caps,
            ops,
        }
    }
}

/// Software's view of one queue: buffers are handed over in ring order from
/// `next`, and come back through the handler.
#[derive(Default)]
struct Owner {
    next: usize,
    submitted: usize,
}

impl Owner {
    fn owned(&self, n: usize, reported: usize) -> usize {
        n - (self.submitted - reported)
    }
}

fn run_scenario(s: Scenario) -> TestResult {
    let n = s.buffer_count;
    let rig = Rig::new(s.caps, n);
    let mut inb = Owner::default();
    let mut outb = Owner::default();
    let mut produced = 0;
    let mut drained = 0;

    let check = |rig: &Rig, inb: &Owner, outb: &Owner| -> bool {
        if rig.channel.state() != IrqState::Active {
            return false;
        }
        for (q, owner, reported) in [
            (rig.inq(), inb, rig.input.total(IN)),
            (rig.outq(), outb, rig.output.total(OUT)),
        ] {
            let used = q.cursor().in_flight();
            if used < 0 || used as usize > n {
                return false;
            }
            // every consumed buffer was reported in the same pass
            if used as usize != owner.submitted - reported {
                return false;
            }
            if q.cursor().first_to_check() != reported % n {
                return false;
            }
        }
        true
    };

    for op in &s.ops {
        match *op {
            Op::SubmitIn(k) => {
                let free = inb.owned(n, rig.input.total(IN));
                let k = (k as usize % n + 1).min(free);
                if k > 0 {
                    if rig.channel.submit(SubmitFlags::INPUT, 0, inb.next, k).is_err() {
                        return TestResult::failed();
                    }
                    inb.next = (inb.next + k) % n;
                    inb.submitted += k;
                }
            }
            Op::SubmitOut(k) => {
                let free = outb.owned(n, rig.output.total(OUT));
                let k = (k as usize % n + 1).min(free);
                if k > 0 {
                    if rig.channel.submit(SubmitFlags::OUTPUT, 0, outb.next, k).is_err() {
                        return TestResult::failed();
                    }
                    outb.next = (outb.next + k) % n;
                    outb.submitted += k;
                }
            }
            Op::Produce(k) => produced += rig.adapter.produce_input(0, k as usize % n + 1),
            Op::Drain(k) => drained += rig.adapter.drain_output(0, k as usize % n + 1),
            Op::Interrupt => rig.channel.on_interrupt(),
            Op::Tick(t) => rig.clock.advance(Duration::from_micros(100 * t as u64)),
            Op::Poll => {
                rig.channel.poll();
            }
        }
        if !check(&rig, &inb, &outb) {
            return TestResult::failed();
        }
    }

    // the adapter finishes everything it was given
    for _ in 0..4 * n {
        produced += rig.adapter.produce_input(0, n);
        drained += rig.adapter.drain_output(0, n);
        rig.clock.advance(Duration::from_secs(1));
        rig.channel.on_interrupt();
        rig.channel.process_queue(IN).unwrap();
        rig.channel.process_queue(OUT).unwrap();
        rig.channel.poll();
    }
    if !check(&rig, &inb, &outb) {
        return TestResult::failed();
    }

    let in_ranges = rig.input.ranges(IN);
    let out_ranges = rig.output.ranges(OUT);
    assert_contiguous(&in_ranges, n);
    assert_contiguous(&out_ranges, n);
    if in_ranges.first().is_some_and(|r| r.0 != 0) || out_ranges.first().is_some_and(|r| r.0 != 0)
    {
        return TestResult::failed();
    }

    TestResult::from_bool(
        rig.input.total(IN) == produced
            && produced == inb.submitted
            && rig.output.total(OUT) == drained
            && drained == outb.submitted
            && !rig.inq().is_polling(),
    )
}

#[test]
fn prop_interleaved_ring_operations() {
    let tests = if cfg!(miri) { 1 } else { 200 };
    QuickCheck::new()
        .tests(tests)
        .quickcheck(run_scenario as fn(Scenario) -> TestResult);
}

#[test]
fn prop_set_then_get_round_trips() {
    fn prop(batched: bool, input: bool, start: u8, count: u8, pick: u8) -> TestResult {
        let caps = if batched {
            Capabilities::BATCHED_STATE_OPS
        } else {
            Capabilities::empty()
        };
        let rig = Rig::new(caps, 16);
        let (q, states) = if input {
            (rig.inq(), [SlsbState::InputNotInit, SlsbState::InputPrimed, SlsbState::InputError])
        } else {
            (rig.outq(), [SlsbState::OutputNotInit, SlsbState::OutputEmpty, SlsbState::OutputError])
        };
        let state = states[pick as usize % states.len()];
        let start = start as usize % 16;
        let count = count as usize % 16 + 1;

        let ctx = rig.channel.engine_context();
        let set = ctx.store.set_states(q, start, state, count).unwrap();
        let got = ctx.store.get_states(q, start, count, false).unwrap();
        TestResult::from_bool(set == count && got == Some(StateRun { count, state }))
    }

    let tests = if cfg!(miri) { 5 } else { 300 };
    QuickCheck::new()
        .tests(tests)
        .quickcheck(prop as fn(bool, bool, u8, u8, u8) -> TestResult);
}

#[test]
fn stop_polling_twice_is_a_no_op() {
    for caps in [Capabilities::empty(), Capabilities::BATCHED_STATE_OPS] {
        let rig = Rig::new(caps, 8);
        rig.channel.submit(SubmitFlags::INPUT, 0, 0, 6).unwrap();
        rig.adapter.fill_input(0, 0, 3);
        rig.channel.on_interrupt();
        rig.channel.run_pending();
        assert!(rig.inq().is_polling(), "{:?}", caps);

        let engine = rig.channel.inbound_engine();
        assert_eq!(engine.stop_polling(rig.inq()), Ok(true));
        let after_first: Vec<u8> = (0..8).map(|i| rig.adapter.state(IN, i)).collect();
        assert_eq!(engine.stop_polling(rig.inq()), Ok(false));
        let after_second: Vec<u8> = (0..8).map(|i| rig.adapter.state(IN, i)).collect();
        assert_eq!(after_first, after_second);
        assert!(!rig.inq().snapshot().polling);
    }
}

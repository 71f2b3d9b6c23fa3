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
#![no_main]

use std::sync::Arc;
use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use qdio_core::{Capabilities, Channel, ChannelConfiguration, IrqState, QueueId, SubmitFlags};
use qdio_testing::{ManualClock, RecordingHandler, SimulatedAdapter};

#[derive(Arbitrary, Debug)]
enum Op {
    SubmitIn(u8),
    SubmitOut(u8, bool),
    Produce(u8),
    Drain(u8),
    FailIn,
    FailOut,
    Interrupt,
    Tick(u16),
    Poll,
}

#[derive(Arbitrary, Debug)]
struct Input {
    caps: u32,
    ring_shift: u8,
    ops: Vec<Op>,
}

const IN: QueueId = QueueId::input(0);
const OUT: QueueId = QueueId::output(0);

// Drives random submit / adapter / interrupt / timer sequences through one
// channel and checks the ring accounting after every step.
fuzz_target!(|input: Input| {
    let n = 1usize << (input.ring_shift % 7 + 1);
    let caps = Capabilities::from_bits_truncate(input.caps);
    let adapter = Arc::new(SimulatedAdapter::new(caps));
    let clock = Arc::new(ManualClock::new());
    let in_handler = Arc::new(RecordingHandler::new());
    let out_handler = Arc::new(RecordingHandler::new());

    let mut config = ChannelConfiguration::new(1, 1);
    config.set_buffer_count(n);
    let channel = Channel::establish(
        config,
        adapter.clone(),
        clock.clone(),
        in_handler.clone(),
        out_handler.clone(),
    )
    .unwrap();
    channel.activate().unwrap();
    let inq = channel.queue(IN).unwrap();
    let outq = channel.queue(OUT).unwrap();

    let (mut in_next, mut in_submitted) = (0usize, 0usize);
    let (mut out_next, mut out_submitted) = (0usize, 0usize);

    for op in input.ops.iter().take(512) {
        match *op {
            Op::SubmitIn(k) => {
                let free = n - (in_submitted - in_handler.total(IN));
                let k = (k as usize % n + 1).min(free);
                if k > 0 {
                    channel.submit(SubmitFlags::INPUT, 0, in_next, k).unwrap();
                    in_next = (in_next + k) % n;
                    in_submitted += k;
                }
            }
            Op::SubmitOut(k, pci) => {
                let free = n - (out_submitted - out_handler.total(OUT));
                let k = (k as usize % n + 1).min(free);
                if k > 0 {
                    let mut flags = SubmitFlags::OUTPUT;
                    if pci {
                        flags |= SubmitFlags::PCI_OUT;
                    }
                    channel.submit(flags, 0, out_next, k).unwrap();
                    out_next = (out_next + k) % n;
                    out_submitted += k;
                }
            }
            Op::Produce(k) => {
                adapter.produce_input(0, k as usize % n + 1);
            }
            Op::Drain(k) => {
                adapter.drain_output(0, k as usize % n + 1);
            }
            // an error slot is consumed like data, so the accounting below still holds
            Op::FailIn => {
                adapter.fail_next_input(0);
            }
            Op::FailOut => {
                adapter.fail_next_output(0);
            }
            Op::Interrupt => channel.on_interrupt(),
            Op::Tick(us) => clock.advance(Duration::from_micros(us as u64)),
            Op::Poll => {
                channel.poll();
            }
        }

        assert_eq!(channel.state(), IrqState::Active);
        for (q, submitted, reported) in [
            (inq, in_submitted, in_handler.total(IN)),
            (outq, out_submitted, out_handler.total(OUT)),
        ] {
            let used = q.cursor().in_flight();
            assert!(used >= 0 && used as usize <= n);
            assert_eq!(used as usize, submitted - reported);
            assert_eq!(q.cursor().first_to_check(), reported % n);
        }
    }

    for ranges in [in_handler.ranges(IN), out_handler.ranges(OUT)] {
        for pair in ranges.windows(2) {
            assert_eq!(pair[1].0, (pair[0].0 + pair[0].1) % n);
        }
    }
});

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
#![allow(dead_code)]

use std::sync::Arc;

use qdio_core::{Capabilities, Channel, ChannelConfiguration, QueueId};
use qdio_testing::{ManualClock, RecordingHandler, SimulatedAdapter};

pub const IN: QueueId = QueueId::input(0);
pub const OUT: QueueId = QueueId::output(0);

/// A channel wired to a simulated adapter.
pub struct Rig {
    pub adapter: Arc<SimulatedAdapter>,
    pub clock: Arc<ManualClock>,
    pub input: Arc<RecordingHandler>,
    pub output: Arc<RecordingHandler>,
    pub channel: Channel,
}

impl Rig {
    /// Active channel with one queue per direction.
    pub fn new(caps: Capabilities, buffer_count: usize) -> Self {
        Self::with_config(caps, config(buffer_count))
    }

    pub fn with_config(caps: Capabilities, config: ChannelConfiguration) -> Self {
        let rig = Self::established(caps, config);
        rig.channel.activate().unwrap();
        rig
    }

    pub fn established(caps: Capabilities, config: ChannelConfiguration) -> Self {
        let adapter = Arc::new(SimulatedAdapter::new(caps));
        let clock = Arc::new(ManualClock::new());
        let input = Arc::new(RecordingHandler::new());
        let output = Arc::new(RecordingHandler::new());
        let channel = Channel::establish(
            config,
            adapter.clone(),
            clock.clone(),
            input.clone(),
            output.clone(),
        )
        .unwrap();
        Self {
            adapter,
            clock,
            input,
            output,
            channel,
        }
    }

    pub fn inq(&self) -> &qdio_core::Queue {
        self.channel.queue(IN).unwrap()
    }

    pub fn outq(&self) -> &qdio_core::Queue {
        self.channel.queue(OUT).unwrap()
    }
}

pub fn config(buffer_count: usize) -> ChannelConfiguration {
    let mut config = ChannelConfiguration::new(1, 1);
    config.set_buffer_count(buffer_count);
    config
}

/// Consecutive ranges of one queue neither overlap nor leave gaps.
pub fn assert_contiguous(ranges: &[(usize, usize)], buffer_count: usize) {
    for pair in ranges.windows(2) {
        let ((s1, c1), (s2, _)) = (pair[0], pair[1]);
        assert_eq!(s2, (s1 + c1) % buffer_count, "ranges {:?}", ranges);
    }
}

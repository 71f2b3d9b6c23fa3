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
use std::sync::Mutex;

use qdio_core::{ErrorFlags, QueueHandler, QueueId};

/// One handler invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Callout {
    pub queue: QueueId,
    pub errors: ErrorFlags,
    pub first: Option<usize>,
    pub count: usize,
}

/// Stores every callout it receives.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<Callout>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Callout> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last(&self) -> Option<Callout> {
        self.calls.lock().unwrap().last().copied()
    }

    /// Ranges reported for `queue`, skipping range-less notifications.
    pub fn ranges(&self, queue: QueueId) -> Vec<(usize, usize)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.queue == queue)
            .filter_map(|c| c.first.map(|first| (first, c.count)))
            .collect()
    }

    /// Total buffers reported for `queue`.
    pub fn total(&self, queue: QueueId) -> usize {
        self.ranges(queue).iter().map(|(_, count)| count).sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl QueueHandler for RecordingHandler {
    fn on_buffers(&self, queue: QueueId, errors: ErrorFlags, first: Option<usize>, count: usize) {
        self.calls.lock().unwrap().push(Callout {
            queue,
            errors,
            first,
            count,
        });
    }
}

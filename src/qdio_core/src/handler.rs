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

use crate::adapter::QueueId;
use crate::error::ErrorFlags;

/// Completion callback implemented by the upper layer.
///
/// Called from the deferred-work path with the range `[first, first + count)`
/// (wrapping) of buffers the adapter handed back since the previous call on the
/// same queue. Consecutive calls on one queue never overlap and never leave gaps.
/// `first` is `None` for channel-level notifications that carry no range.
///
/// Implementations must not block. They may call [`Channel::submit`] to hand the
/// buffers straight back, but must not call [`Channel::shutdown`].
///
/// [`Channel::submit`]: crate::Channel::submit
/// [`Channel::shutdown`]: crate::Channel::shutdown
pub trait QueueHandler: Send + Sync {
    fn on_buffers(&self, queue: QueueId, errors: ErrorFlags, first: Option<usize>, count: usize);
}

impl<F> QueueHandler for F
where
    F: Fn(QueueId, ErrorFlags, Option<usize>, usize) + Send + Sync,
{
    fn on_buffers(&self, queue: QueueId, errors: ErrorFlags, first: Option<usize>, count: usize) {
        self(queue, errors, first, count)
    }
}

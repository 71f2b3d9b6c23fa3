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

use log::error;

use crate::LOG_TARGET;
use crate::adapter::{Capabilities, QdioAdapter};
use crate::error::QdioError;
use crate::queue::Queue;
use crate::stats::PerfEvent;

/// The adapter's "synchronize shared state" instruction.
///
/// Only issued when the adapter says slot reads cannot be trusted without it
/// ([`Capabilities::SYNC_BEFORE_READ`]). Otherwise every call is a no-op.
pub struct SyncPrimitive {
    adapter: Arc<dyn QdioAdapter>,
    required: bool,
}

impl SyncPrimitive {
    pub fn new(adapter: Arc<dyn QdioAdapter>, capabilities: Capabilities) -> Self {
        Self {
            adapter,
            required: capabilities.contains(Capabilities::SYNC_BEFORE_READ),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Sync the queue's own direction.
    pub fn sync_queue(&self, q: &Queue) -> Result<(), QdioError> {
        let mask = q.id().mask();
        if q.id().is_input() {
            self.sync(q, 0, mask)
        } else {
            self.sync(q, mask, 0)
        }
    }

    /// Sync all output queues. `q` is only used for accounting.
    pub fn sync_output(&self, q: &Queue) -> Result<(), QdioError> {
        self.sync(q, !0, 0)
    }

    /// Sync both directions of every queue. Used right after an interrupt, when
    /// it is not yet known which queues have news.
    pub fn sync_all(&self, q: &Queue) -> Result<(), QdioError> {
        self.sync(q, !0, !0)
    }

    fn sync(&self, q: &Queue, output_mask: u32, input_mask: u32) -> Result<(), QdioError> {
        if !self.required {
            return Ok(());
        }
        q.stats().inc(PerfEvent::SigaSync);
        match self.adapter.sync(output_mask, input_mask) {
            0 => Ok(()),
            cc => {
                error!(target: LOG_TARGET, "{:?}: sync failed, cc {}", q.id(), cc);
                Err(QdioError::SigaFailed { cc })
            }
        }
    }
}

impl core::fmt::Debug for SyncPrimitive {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncPrimitive")
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

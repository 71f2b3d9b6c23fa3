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

//! Channel lifecycle and entry points.
//!
//! A [`Channel`] is owned by the caller and passed by reference into every
//! operation. It is driven from four directions:
//!
//! - the upper layer hands buffers over with [`Channel::submit`],
//! - the adapter's data interrupt calls [`Channel::on_interrupt`],
//! - control-path failures arrive through [`Channel::on_channel_error`],
//! - deferred work runs from [`Channel::poll`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use log::{debug, error, info, trace};
use smallvec::SmallVec;
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::adapter::{Capabilities, EstablishRequest, QdioAdapter, QueueId};
use crate::clock::Clock;
use crate::config::ChannelConfiguration;
use crate::error::{ControlError, ErrorFlags, QdioError};
use crate::handler::QueueHandler;
use crate::inbound::InboundEngine;
use crate::irq::{IrqState, IrqStateMachine};
use crate::outbound::OutboundEngine;
use crate::queue::{EngineContext, Queue};
use crate::slsb::{BatchedStateStore, BufferStateStore, SoftwareStateStore};
use crate::stats::QueueStats;
use crate::sync::SyncPrimitive;
use crate::{LOG_TARGET, MAX_QUEUES_PER_DIRECTION};

bitflags! {
    /// Flags of an upper-layer submission.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SubmitFlags: u32 {
        /// Buffers go back to an inbound queue.
        const INPUT   = 1 << 0;
        /// Buffers are queued for output.
        const OUTPUT  = 1 << 1;
        /// Ask the adapter for a completion interrupt for this batch.
        const PCI_OUT = 1 << 2;
    }
}

type Queues = SmallVec<[Queue; MAX_QUEUES_PER_DIRECTION]>;

/// One established channel and its queues.
pub struct Channel {
    pub(crate) config: ChannelConfiguration,
    pub(crate) capabilities: Capabilities,
    pub(crate) irq: IrqStateMachine,
    pub(crate) adapter: Arc<dyn QdioAdapter>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: Box<dyn BufferStateStore>,
    pub(crate) sync: SyncPrimitive,
    pub(crate) input_queues: Queues,
    pub(crate) output_queues: Queues,
    input_handler: Arc<dyn QueueHandler>,
    output_handler: Arc<dyn QueueHandler>,
    error_reported: AtomicBool,
}

impl Channel {
    /// Allocate the queues, hand them to the adapter and negotiate capabilities.
    ///
    /// On success the channel is Established. Capabilities stay fixed until the
    /// channel is dropped; establishing again means building a new one.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Debug"))]
    pub fn establish(
        config: ChannelConfiguration,
        adapter: Arc<dyn QdioAdapter>,
        clock: Arc<dyn Clock>,
        input_handler: Arc<dyn QueueHandler>,
        output_handler: Arc<dyn QueueHandler>,
    ) -> Result<Self, QdioError> {
        config.validate()?;
        let irq = IrqStateMachine::new();
        irq.transition(IrqState::Cleanup)?;

        let buffer_count = config.buffer_count();
        let input_queues: Queues = (0..config.input_queues())
            .map(|nr| Queue::new(QueueId::input(nr), buffer_count))
            .collect();
        let output_queues: Queues = (0..config.output_queues())
            .map(|nr| Queue::new(QueueId::output(nr), buffer_count))
            .collect();

        let request = EstablishRequest {
            buffer_count,
            input: input_queues.iter().map(|q| q.slsb().clone()).collect(),
            output: output_queues.iter().map(|q| q.slsb().clone()).collect(),
        };
        let info = match adapter.establish(&request) {
            Ok(info) => info,
            Err(err) => {
                error!(target: LOG_TARGET, "establish failed: {}", err);
                irq.fail(IrqState::Error);
                return Err(err.into());
            }
        };
        if buffer_count > info.max_buffers {
            adapter.halt();
            return Err(QdioError::InvalidConfiguration(
                "buffer count exceeds what the adapter supports",
            ));
        }

        let capabilities = info.capabilities;
        let store: Box<dyn BufferStateStore> =
            if capabilities.contains(Capabilities::BATCHED_STATE_OPS) {
                Box::new(BatchedStateStore::new(
                    adapter.clone(),
                    config.batch_retry_limit(),
                ))
            } else {
                Box::new(SoftwareStateStore)
            };
        let sync = SyncPrimitive::new(adapter.clone(), capabilities);

        irq.transition(IrqState::Established)?;
        info!(
            target: LOG_TARGET,
            "established {} input / {} output queues of {} buffers, capabilities {:?}",
            input_queues.len(),
            output_queues.len(),
            buffer_count,
            capabilities
        );

        Ok(Self {
            config,
            capabilities,
            irq,
            adapter,
            clock,
            store,
            sync,
            input_queues,
            output_queues,
            input_handler,
            output_handler,
            error_reported: AtomicBool::new(false),
        })
    }

    /// Start data transfer. Only valid from Established.
    pub fn activate(&self) -> Result<(), QdioError> {
        let state = self.irq.state();
        if state != IrqState::Established {
            return Err(QdioError::InvalidTransition {
                from: state,
                to: IrqState::Active,
            });
        }
        if let Err(err) = self.adapter.activate() {
            self.on_channel_error(err);
            return Err(err.into());
        }
        self.irq.transition(IrqState::Active)?;
        info!(target: LOG_TARGET, "channel active");
        Ok(())
    }

    /// Hand `count` buffers starting at `start` of queue `queue_nr` to the adapter.
    ///
    /// `flags` must name exactly one direction. A zero `count` is accepted and
    /// does nothing.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn submit(
        &self,
        flags: SubmitFlags,
        queue_nr: usize,
        start: usize,
        count: usize,
    ) -> Result<(), QdioError> {
        let buffer_count = self.config.buffer_count();
        if start >= buffer_count {
            return Err(QdioError::InvalidArgument("start index out of range"));
        }
        if count > buffer_count {
            return Err(QdioError::InvalidArgument("count larger than the ring"));
        }
        if queue_nr >= MAX_QUEUES_PER_DIRECTION {
            return Err(QdioError::InvalidArgument("queue number out of range"));
        }

        let state = self.irq.state();
        if state != IrqState::Active {
            return Err(QdioError::NotActive(state));
        }

        let id = match (
            flags.contains(SubmitFlags::INPUT),
            flags.contains(SubmitFlags::OUTPUT),
        ) {
            (true, false) => QueueId::input(queue_nr),
            (false, true) => QueueId::output(queue_nr),
            _ => return Err(QdioError::Invalid),
        };
        let q = self
            .queue(id)
            .ok_or(QdioError::InvalidArgument("queue not configured"))?;

        if count == 0 {
            return Ok(());
        }

        let result = if id.is_input() {
            self.inbound_engine().handle_submit(q, start, count)
        } else {
            self.outbound_engine()
                .handle_submit(q, start, count, flags)
        };
        if let Err(err) = result
            && err.is_fatal()
        {
            self.protocol_violation(err);
        }
        result
    }

    /// Data interrupt from the adapter.
    pub fn on_interrupt(&self) {
        if !self.irq.is_active() {
            debug!(target: LOG_TARGET, "interrupt ignored in {:?}", self.irq.state());
            return;
        }
        if let Some(q) = self.queues().next()
            && let Err(err) = self.sync.sync_all(q)
        {
            // the passes below still run
            trace!(target: LOG_TARGET, "interrupt sync failed: {}", err);
        }
        for q in self.input_queues.iter() {
            q.schedule();
        }
        if self
            .capabilities
            .contains(Capabilities::OUTPUT_INTERRUPTS)
        {
            let engine = self.outbound_engine();
            for q in self.output_queues.iter() {
                if !engine.queue_done(q) {
                    q.schedule();
                }
            }
        }
    }

    /// Control-path failure reported by the adapter or the bus.
    ///
    /// An activate check stops the channel, anything else moves it to Error. The
    /// upper layer hears about it once, through the first queue's handler, with
    /// [`ErrorFlags::ACTIVATE_CHECK`] and no buffer range. Errors arriving during
    /// or after [`Channel::shutdown`] are only logged.
    pub fn on_channel_error(&self, err: ControlError) {
        let target = match err {
            ControlError::ActivateCheck => IrqState::Stopped,
            ControlError::Timeout | ControlError::IoError { .. } => IrqState::Error,
        };
        error!(target: LOG_TARGET, "channel error: {}", err);
        match self.irq.fail(target) {
            Some(IrqState::Established | IrqState::Active) => {}
            Some(prev) => {
                debug!(target: LOG_TARGET, "channel {:?} -> {:?} during teardown", prev, target);
                return;
            }
            None => {
                debug!(target: LOG_TARGET, "channel already down ({:?})", self.irq.state());
                return;
            }
        }

        if self.error_reported.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(q) = self.queues().next() {
            self.handler_for(q.id())
                .on_buffers(q.id(), ErrorFlags::ACTIVATE_CHECK, None, 0);
        }
    }

    /// Quiesce and halt.
    ///
    /// No handler runs once this returns, and the adapter has been told to stop
    /// touching the state arrays. Must not be called from a handler.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Debug"))]
    pub fn shutdown(&self) -> Result<(), QdioError> {
        self.error_reported.store(true, Ordering::Release);
        for q in self.queues() {
            q.tasklet().disable();
        }
        let state = self.irq.state();
        if state == IrqState::Inactive {
            return Ok(());
        }
        if state != IrqState::Cleanup {
            self.irq.transition(IrqState::Cleanup)?;
        }

        for q in self.queues() {
            // wait out a pass that passed the state check before Cleanup
            q.drain();
            q.timer().cancel();
            q.tasklet().take();
        }
        self.adapter.halt();
        self.irq.transition(IrqState::Inactive)?;
        info!(target: LOG_TARGET, "channel shut down");
        Ok(())
    }

    pub fn state(&self) -> IrqState {
        self.irq.state()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn config(&self) -> &ChannelConfiguration {
        &self.config
    }

    pub fn queue(&self, id: QueueId) -> Option<&Queue> {
        if id.is_input() {
            self.input_queues.get(id.nr)
        } else {
            self.output_queues.get(id.nr)
        }
    }

    /// Inbound queues first, then outbound.
    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.input_queues.iter().chain(self.output_queues.iter())
    }

    pub fn queue_stats(&self, id: QueueId) -> Option<QueueStats> {
        self.queue(id).map(Queue::snapshot)
    }

    /// Snapshot of every queue.
    pub fn stats(&self) -> Vec<(QueueId, QueueStats)> {
        self.queues().map(|q| (q.id(), q.snapshot())).collect()
    }

    pub fn engine_context(&self) -> EngineContext<'_> {
        EngineContext {
            capabilities: self.capabilities,
            config: &self.config,
            store: self.store.as_ref(),
            sync: &self.sync,
            adapter: self.adapter.as_ref(),
            clock: self.clock.as_ref(),
        }
    }

    pub fn inbound_engine(&self) -> InboundEngine<'_> {
        InboundEngine::new(self.engine_context())
    }

    pub fn outbound_engine(&self) -> OutboundEngine<'_> {
        OutboundEngine::new(self.engine_context())
    }

    pub(crate) fn handler_for(&self, id: QueueId) -> &dyn QueueHandler {
        if id.is_input() {
            self.input_handler.as_ref()
        } else {
            self.output_handler.as_ref()
        }
    }

    pub(crate) fn protocol_violation(&self, err: QdioError) {
        error!(target: LOG_TARGET, "{}", err);
        self.irq.fail(IrqState::Error);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(target: LOG_TARGET, "shutdown on drop failed: {}", err);
        }
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.irq.state())
            .field("capabilities", &self.capabilities)
            .field("input_queues", &self.input_queues.len())
            .field("output_queues", &self.output_queues.len())
            .finish_non_exhaustive()
    }
}

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

//! Per-queue deferred work.
//!
//! Every queue has a [`Tasklet`]: a scheduled flag set from the interrupt path, the
//! submit path, timers, or a pass that wants to run again. [`Channel::run_pending`]
//! runs each scheduled queue once. A pass first takes the queue's run lock with a
//! non-blocking try; if another pass holds it the request is put back, so the
//! queue runs again once the lock is free.
//!
//! Outbound queues also have a [`QueueTimer`], a safety net for adapters that do
//! not interrupt promptly for output completions. [`Channel::run_timers`] turns
//! expired timers into scheduled passes.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;

use log::{debug, error, trace, warn};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::LOG_TARGET;
use crate::adapter::{Capabilities, QueueId};
use crate::channel::Channel;
use crate::error::QdioError;
use crate::irq::IrqState;
use crate::queue::{EngineState, Queue};
use crate::stats::PerfEvent;

/// Scheduling state of one queue's processing pass.
#[derive(Debug, Default)]
pub struct Tasklet {
    scheduled: AtomicBool,
    disabled: AtomicBool,
}

impl Tasklet {
    pub const fn new() -> Self {
        Self {
            scheduled: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
        }
    }

    /// Request a pass. Ignored once disabled. Returns whether this call did the
    /// scheduling.
    pub fn schedule(&self) -> bool {
        if self.disabled.load(Ordering::Acquire) {
            return false;
        }
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    /// Consume a pending request.
    pub(crate) fn take(&self) -> bool {
        self.scheduled.swap(false, Ordering::AcqRel)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }
}

/// One-shot timer. A deadline of zero means not armed.
#[derive(Debug, Default)]
pub struct QueueTimer {
    deadline_ns: AtomicU64,
}

impl QueueTimer {
    pub const fn new() -> Self {
        Self {
            deadline_ns: AtomicU64::new(0),
        }
    }

    /// Arm unless already armed. Returns whether this call armed it.
    pub fn arm_if_idle(&self, deadline: Duration) -> bool {
        let ns = u64::try_from(deadline.as_nanos())
            .unwrap_or(u64::MAX)
            .max(1);
        self.deadline_ns
            .compare_exchange(0, ns, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn cancel(&self) {
        self.deadline_ns.store(0, Ordering::Release);
    }

    pub fn deadline(&self) -> Option<Duration> {
        match self.deadline_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    /// Disarm and return true if the deadline has passed.
    pub(crate) fn take_expired(&self, now: Duration) -> bool {
        let ns = self.deadline_ns.load(Ordering::Acquire);
        if ns == 0 || u64::try_from(now.as_nanos()).unwrap_or(u64::MAX) < ns {
            return false;
        }
        self.deadline_ns
            .compare_exchange(ns, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Channel {
    /// Run every scheduled pass once. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        for q in self.queues() {
            if q.tasklet().take() && self.process(q) {
                ran += 1;
            }
        }
        ran
    }

    /// Schedule the outbound queues whose timer expired. Returns how many fired.
    pub fn run_timers(&self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        for q in self.output_queues.iter() {
            if !q.timer().take_expired(now) {
                continue;
            }
            if self.irq.state() == IrqState::Stopped {
                continue;
            }
            debug!(target: LOG_TARGET, "{:?}: timer fired", q.id());
            q.schedule();
            fired += 1;
        }
        // with output interrupts the outbound pass does not sync on its own
        if fired > 0
            && self
                .capabilities
                .contains(Capabilities::OUTPUT_INTERRUPTS)
            && let Some(q) = self.output_queues.first()
            && let Err(err) = self.sync.sync_output(q)
        {
            trace!(target: LOG_TARGET, "timer sync failed: {}", err);
        }
        fired
    }

    /// Fire expired timers, then run everything scheduled.
    pub fn poll(&self) -> usize {
        self.run_timers();
        self.run_pending()
    }

    /// Run one processing pass of a queue right away.
    pub fn process_queue(&self, id: QueueId) -> Result<(), QdioError> {
        let q = self
            .queue(id)
            .ok_or(QdioError::InvalidArgument("no such queue"))?;
        self.process(q);
        Ok(())
    }

    /// Returns whether a pass actually ran.
    fn process(&self, q: &Queue) -> bool {
        let Some(mut st) = q.try_run() else {
            // the running pass may already be past its last check
            trace!(target: LOG_TARGET, "{:?}: pass already running, requeued", q.id());
            q.schedule();
            return false;
        };
        if q.tasklet().is_disabled() || !self.irq.engines_may_run() {
            return false;
        }
        q.stats().inc(PerfEvent::TaskletRun);

        let result = if q.id().is_input() {
            self.inbound_pass(q, &mut st)
        } else {
            self.outbound_pass(q)
        };
        if let Err(err) = result {
            self.engine_failure(q, err);
        }
        true
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    fn inbound_pass(&self, q: &Queue, st: &mut EngineState) -> Result<(), QdioError> {
        let engine = self.inbound_engine();
        if !engine.queue_moved(q, st)? {
            return Ok(());
        }
        self.kick_handler(q);

        if !engine.queue_done(q, st)? && self.reschedule(q) {
            return Ok(());
        }
        engine.stop_polling(q)?;

        // withdrawing the ack can expose new data
        if !engine.queue_done(q, st)? {
            self.reschedule(q);
        }
        Ok(())
    }

    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    fn outbound_pass(&self, q: &Queue) -> Result<(), QdioError> {
        let engine = self.outbound_engine();
        if engine.queue_moved(q)? {
            self.kick_handler(q);
        }

        let in_flight = q.cursor().in_flight().max(0) as usize;
        if in_flight > self.config.output_poll_level() {
            self.reschedule(q);
            return Ok(());
        }
        // the adapter will interrupt for the rest
        if q.pci_out_enabled() {
            return Ok(());
        }
        if engine.queue_done(q) {
            q.timer().cancel();
        } else if self.irq.is_active() {
            let deadline = self.clock.now() + self.config.output_idle_timer();
            if q.timer().arm_if_idle(deadline) {
                debug!(target: LOG_TARGET, "{:?}: idle timer armed", q.id());
            }
        }
        Ok(())
    }

    /// Schedule another pass while the channel is active.
    fn reschedule(&self, q: &Queue) -> bool {
        if !self.irq.is_active() {
            return false;
        }
        q.stats().inc(PerfEvent::TaskletResched);
        q.schedule();
        true
    }

    /// Report `[first_to_kick, first_to_check)` to the handler.
    pub(crate) fn kick_handler(&self, q: &Queue) {
        if !self.irq.is_active() {
            return;
        }
        let cursor = q.cursor();
        let start = cursor.first_to_kick();
        let end = cursor.first_to_check();
        let count = cursor.sub(end, start);
        let errors = q.take_errors();

        q.stats().inc(PerfEvent::HandlerCall);
        trace!(target: LOG_TARGET, "{:?}: kih s:{} c:{} e:{:?}", q.id(), start, count, errors);
        self.handler_for(q.id())
            .on_buffers(q.id(), errors, Some(start), count);
        cursor.set_first_to_kick(end);
    }

    fn engine_failure(&self, q: &Queue, err: QdioError) {
        match err {
            QdioError::ProtocolViolation { .. } => self.protocol_violation(err),
            QdioError::GetBufState { .. }
            | QdioError::SetBufState { .. }
            | QdioError::BatchStalled(_) => {
                // report at the frontier and give up on this pass
                let first = q.cursor().first_to_check();
                let count = q.cursor().scan_limit();
                error!(target: LOG_TARGET, "{:?}: {} at {}", q.id(), err, first);
                if self.irq.is_active() {
                    self.handler_for(q.id())
                        .on_buffers(q.id(), err.error_flags(), Some(first), count);
                }
            }
            other => warn!(target: LOG_TARGET, "{:?}: pass failed: {}", q.id(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use core::time::Duration;

    use super::*;
    use crate::channel::SubmitFlags;
    use crate::error::{ControlError, ErrorFlags};
    use crate::slsb::SlsbState;
    use crate::testutil::TestChannel;

    #[test]
    fn tasklet_schedule_once_and_disable() {
        let t = Tasklet::new();
        assert!(t.schedule());
        assert!(!t.schedule());
        assert!(t.take());
        assert!(!t.take());
        t.disable();
        assert!(!t.schedule());
        assert!(!t.is_scheduled());
    }

    #[test]
    fn timer_arms_once_and_expires() {
        let t = QueueTimer::new();
        assert!(t.arm_if_idle(Duration::from_millis(5)));
        assert!(!t.arm_if_idle(Duration::from_millis(1)));
        assert_eq!(t.deadline(), Some(Duration::from_millis(5)));
        assert!(!t.take_expired(Duration::from_millis(4)));
        assert!(t.take_expired(Duration::from_millis(5)));
        assert_eq!(t.deadline(), None);
        assert!(!t.take_expired(Duration::from_millis(6)));
    }

    #[test]
    fn inbound_pass_reports_and_stops_polling() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::INPUT, 0, 0, 3).unwrap();
        tc.inq().slsb().fill(0, 3, SlsbState::InputPrimed.raw());

        tc.channel.on_interrupt();
        assert_eq!(tc.channel.run_pending(), 1);

        let calls = tc.input.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].first, calls[0].count), (Some(0), 3));
        assert!(!tc.inq().is_polling());
        assert_eq!(tc.inq().slsb().load(2), SlsbState::InputNotInit.raw());
    }

    #[test]
    fn inbound_pass_keeps_polling_within_threshold() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::INPUT, 0, 0, 6).unwrap();
        tc.inq().slsb().fill(0, 2, SlsbState::InputPrimed.raw());

        tc.channel.on_interrupt();
        tc.channel.run_pending();
        assert!(tc.inq().is_polling());
        assert!(tc.inq().tasklet().is_scheduled());
        assert_eq!(tc.inq().stats().get(PerfEvent::TaskletResched), 1);

        // nothing new: the rescheduled pass leaves quietly
        tc.channel.run_pending();
        assert!(!tc.inq().tasklet().is_scheduled());
        assert_eq!(tc.input.calls().len(), 1);

        // the next arrival continues exactly where the last report ended
        tc.inq().slsb().fill(2, 1, SlsbState::InputPrimed.raw());
        tc.clock.advance(Duration::from_millis(1));
        tc.channel.process_queue(QueueId::input(0)).unwrap();
        assert_eq!(tc.input.calls().len(), 2);
        assert_eq!(tc.input.calls()[1].first, Some(2));
        assert_eq!(tc.input.calls()[1].count, 1);
    }

    #[test]
    fn busy_run_lock_skips_the_pass() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::INPUT, 0, 0, 2).unwrap();
        tc.inq().slsb().fill(0, 2, SlsbState::InputPrimed.raw());

        let guard = tc.inq().try_run();
        tc.channel.process_queue(QueueId::input(0)).unwrap();
        assert!(tc.input.calls().is_empty());
        drop(guard);
        tc.channel.process_queue(QueueId::input(0)).unwrap();
        assert_eq!(tc.input.calls().len(), 1);
    }

    #[test]
    fn skipped_pass_is_requeued() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::INPUT, 0, 0, 4).unwrap();

        let guard = tc.inq().try_run();
        tc.inq().slsb().fill(0, 2, SlsbState::InputPrimed.raw());
        tc.channel.on_interrupt();
        assert_eq!(tc.channel.run_pending(), 0);
        assert!(tc.inq().tasklet().is_scheduled());
        drop(guard);

        assert_eq!(tc.channel.run_pending(), 1);
        let calls = tc.input.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!((calls[0].first, calls[0].count), (Some(0), 2));
    }

    #[test]
    fn far_deadlines_saturate() {
        let t = QueueTimer::new();
        assert!(t.arm_if_idle(Duration::MAX));
        assert_eq!(t.deadline(), Some(Duration::from_nanos(u64::MAX)));
        assert!(!t.take_expired(Duration::from_secs(1)));
        assert!(t.take_expired(Duration::MAX));
    }

    #[test]
    fn outbound_pass_cancels_timer_when_drained() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::OUTPUT, 0, 0, 2).unwrap();
        assert!(tc.outq().timer().deadline().is_some());

        tc.outq().slsb().fill(0, 2, SlsbState::OutputEmpty.raw());
        tc.channel.process_queue(QueueId::output(0)).unwrap();
        assert_eq!(tc.output.calls().len(), 1);
        assert!(tc.outq().timer().deadline().is_none());
    }

    #[test]
    fn outbound_pass_arms_idle_timer_while_in_flight() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::OUTPUT, 0, 0, 3).unwrap();
        tc.outq().timer().cancel();
        tc.outq().slsb().fill(0, 1, SlsbState::OutputEmpty.raw());

        tc.channel.process_queue(QueueId::output(0)).unwrap();
        assert_eq!(
            tc.outq().timer().deadline(),
            Some(crate::ChannelConfiguration::DEFAULT_OUTPUT_IDLE_TIMER)
        );
    }

    #[test]
    fn pci_out_leaves_the_timer_alone() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel
            .submit(SubmitFlags::OUTPUT | SubmitFlags::PCI_OUT, 0, 0, 3)
            .unwrap();
        tc.outq().timer().cancel();
        tc.channel.process_queue(QueueId::output(0)).unwrap();
        assert!(tc.outq().timer().deadline().is_none());
    }

    #[test]
    fn expired_timer_runs_the_outbound_pass() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::OUTPUT, 0, 0, 1).unwrap();
        tc.outq().slsb().fill(0, 1, SlsbState::OutputEmpty.raw());

        assert_eq!(tc.channel.poll(), 0);
        tc.clock.advance(Duration::from_secs(2));
        assert_eq!(tc.channel.run_timers(), 1);
        assert_eq!(tc.channel.run_pending(), 1);
        assert_eq!(tc.output.calls().len(), 1);
    }

    #[test]
    fn expired_timer_syncs_outputs_when_the_adapter_interrupts_for_them() {
        let caps = Capabilities::OUTPUT_INTERRUPTS | Capabilities::SYNC_BEFORE_READ;
        let tc = TestChannel::new(caps, 8);
        tc.channel.submit(SubmitFlags::OUTPUT, 0, 0, 1).unwrap();
        assert!(tc.outq().timer().deadline().is_some());
        tc.outq().slsb().fill(0, 1, SlsbState::OutputEmpty.raw());

        tc.clock.advance(Duration::from_secs(2));
        assert_eq!(tc.channel.run_timers(), 1);
        assert_eq!(tc.adapter.syncs().last(), Some(&(u32::MAX, 0)));
        assert_eq!(tc.channel.run_pending(), 1);
        assert_eq!(tc.output.calls().len(), 1);
    }

    #[test]
    fn timers_are_ignored_once_stopped() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::OUTPUT, 0, 0, 1).unwrap();
        tc.channel.on_channel_error(ControlError::ActivateCheck);
        tc.clock.advance(Duration::from_secs(2));
        assert_eq!(tc.channel.run_timers(), 0);
    }

    #[test]
    fn outbound_above_poll_level_reschedules() {
        let mut config = crate::ChannelConfiguration::new(1, 1);
        config.set_buffer_count(8);
        config.set_output_poll_level(2);
        let tc = TestChannel::with_config(Capabilities::empty(), config);
        tc.channel.submit(SubmitFlags::OUTPUT, 0, 0, 4).unwrap();

        tc.channel.process_queue(QueueId::output(0)).unwrap();
        assert!(tc.outq().tasklet().is_scheduled());
    }

    #[test]
    fn batched_failure_is_reported_at_the_frontier() {
        let tc = TestChannel::new(Capabilities::BATCHED_STATE_OPS, 8);
        tc.channel.submit(SubmitFlags::INPUT, 0, 0, 4).unwrap();
        tc.adapter.fail_batched(7);

        tc.channel.process_queue(QueueId::input(0)).unwrap();
        let calls = tc.input.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].errors, ErrorFlags::GET_BUF_STATE);
        assert_eq!((calls[0].first, calls[0].count), (Some(0), 4));
    }

    #[test]
    fn protocol_violation_moves_the_channel_to_error() {
        let tc = TestChannel::new(Capabilities::empty(), 8);
        tc.channel.submit(SubmitFlags::INPUT, 0, 0, 2).unwrap();
        tc.inq().slsb().store(0, 0x13);

        tc.channel.process_queue(QueueId::input(0)).unwrap();
        assert_eq!(tc.channel.state(), IrqState::Error);
        assert!(tc.input.calls().is_empty());
    }
}

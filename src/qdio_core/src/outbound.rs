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

//! Outbound frontier engine.
//!
//! Software primes buffers (`CuOutputPrimed`) and rings the doorbell; the adapter
//! drains them and flips them to `OutputEmpty`. The engine reclaims emptied and
//! errored runs from `first_to_check` on.

use core::hint::spin_loop;

use log::{error, trace, warn};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::LOG_TARGET;
use crate::adapter::Capabilities;
use crate::channel::SubmitFlags;
use crate::error::{ErrorFlags, ProtocolViolation, QdioError};
use crate::queue::{EngineContext, Queue};
use crate::slsb::SlsbState;
use crate::stats::PerfEvent;

pub struct OutboundEngine<'a> {
    ctx: EngineContext<'a>,
}

impl<'a> OutboundEngine<'a> {
    pub fn new(ctx: EngineContext<'a>) -> Self {
        Self { ctx }
    }

    fn has(&self, cap: Capabilities) -> bool {
        self.ctx.capabilities.contains(cap)
    }

    /// Reclaim emptied and errored runs. Returns the new `first_to_check`.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn advance_frontier(&self, q: &Queue) -> Result<usize, QdioError> {
        let cursor = q.cursor();
        let batched = self.ctx.store.is_batched();

        if !self.has(Capabilities::OUTPUT_INTERRUPTS)
            && let Err(err) = self.ctx.sync.sync_queue(q)
        {
            // the read below still tells us something
            trace!(target: LOG_TARGET, "{:?}: sync before scan failed: {}", q.id(), err);
        }

        let mut ftc = cursor.first_to_check();
        let stop = cursor.add(ftc, cursor.scan_limit());

        while ftc != stop {
            let remaining = cursor.sub(stop, ftc);
            let Some(run) = self.ctx.store.get_states(q, ftc, remaining, false)? else {
                break;
            };
            match run.state {
                SlsbState::OutputEmpty => {
                    trace!(target: LOG_TARGET, "{:?}: out empty {}:{}", q.id(), ftc, run.count);
                    ftc = cursor.add(ftc, run.count);
                    cursor.set_first_to_check(ftc);
                    cursor.release(q.id(), run.count)?;
                    q.stats().add(PerfEvent::BuffersProcessed, run.count as u64);
                }
                SlsbState::OutputError => {
                    warn!(target: LOG_TARGET, "{:?}: out err {}:{}", q.id(), ftc, run.count);
                    q.raise(ErrorFlags::SLSB_STATE);
                    q.stats().inc(PerfEvent::ErrorRun);
                    ftc = cursor.add(ftc, run.count);
                    cursor.set_first_to_check(ftc);
                    cursor.release(q.id(), run.count)?;
                    q.stats().add(PerfEvent::BuffersProcessed, run.count as u64);
                }
                SlsbState::CuOutputPrimed => {
                    trace!(target: LOG_TARGET, "{:?}: out primed {}", q.id(), ftc);
                    q.stats().inc(PerfEvent::NopRun);
                    break;
                }
                SlsbState::OutputNotInit | SlsbState::OutputHalted => break,
                other => {
                    return Err(QdioError::violation(
                        q.id(),
                        ProtocolViolation::UnexpectedState {
                            index: ftc,
                            state: other.raw(),
                        },
                    ));
                }
            }
            // one batched extract already took everything it could
            if batched {
                break;
            }
        }
        Ok(ftc)
    }

    /// Advance the frontier and report whether the handler has anything to see.
    pub fn queue_moved(&self, q: &Queue) -> Result<bool, QdioError> {
        let ftc = self.advance_frontier(q)?;
        let cursor = q.cursor();
        if ftc != cursor.last_move() || q.has_errors() {
            cursor.set_last_move(ftc);
            return Ok(true);
        }
        Ok(false)
    }

    /// Nothing left in flight.
    pub fn queue_done(&self, q: &Queue) -> bool {
        q.cursor().in_flight() == 0
    }

    /// Ring the output doorbell for `count` newly primed buffers.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn kick(&self, q: &Queue, count: usize) -> Result<(), QdioError> {
        if !self.has(Capabilities::OUTPUT_DOORBELL) {
            return Ok(());
        }
        if count <= 1 || self.has(Capabilities::MULTI_BUFFER_DOORBELL) {
            return self.signal(q, count);
        }
        for _ in 0..count {
            self.signal(q, 1)?;
        }
        Ok(())
    }

    /// One doorbell, retried while the adapter is busy and the patience window
    /// has not run out.
    fn signal(&self, q: &Queue, buffers: usize) -> Result<(), QdioError> {
        let patience = self.ctx.config.busy_patience();
        let mut busy_since = None;
        let mut retries = 0u32;

        loop {
            q.stats().inc(PerfEvent::SigaWrite);
            let out = self.ctx.adapter.signal_output(q.id(), buffers);
            if out.cc == 0 {
                if retries > 0 {
                    warn!(target: LOG_TARGET, "{:?}: doorbell busy, cleared after {} retries", q.id(), retries);
                }
                return Ok(());
            }
            if out.is_busy() {
                let now = self.ctx.clock.now();
                let since = *busy_since.get_or_insert(now);
                if now.saturating_sub(since) < patience {
                    retries += 1;
                    spin_loop();
                    continue;
                }
                error!(target: LOG_TARGET, "{:?}: doorbell still busy after {:?}", q.id(), patience);
                q.raise(ErrorFlags::SIGA_BUSY);
                return Err(QdioError::SigaBusy);
            }
            error!(target: LOG_TARGET, "{:?}: doorbell failed, cc {}", q.id(), out.cc);
            q.raise(ErrorFlags::SIGA_ERROR);
            return Err(QdioError::SigaFailed { cc: out.cc });
        }
    }

    /// Prime `count` buffers at `start` and tell the adapter.
    ///
    /// The buffers are handed over even when the doorbell fails; the error is
    /// returned after the queue's scan has been scheduled.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn handle_submit(
        &self,
        q: &Queue,
        start: usize,
        count: usize,
        flags: SubmitFlags,
    ) -> Result<(), QdioError> {
        let cursor = q.cursor();
        q.stats().inc(PerfEvent::Submit);

        let set = self
            .ctx
            .store
            .set_states(q, start, SlsbState::CuOutputPrimed, count)?;
        let used = cursor.claim(q.id(), set)? as usize + set;
        if used == cursor.buffer_count() {
            q.stats().inc(PerfEvent::QueueFull);
        }
        q.set_pci_out_enabled(flags.contains(SubmitFlags::PCI_OUT));

        let rc = if self.has(Capabilities::OUTPUT_DOORBELL) {
            let prev = cursor.prev(start);
            if self.has(Capabilities::FAST_REQUEUE)
                && self.ctx.store.get_state(q, prev)? == SlsbState::CuOutputPrimed
            {
                // the adapter is still on this queue and will see the new buffers
                q.stats().inc(PerfEvent::FastRequeue);
                Ok(())
            } else {
                self.kick(q, set)
            }
        } else {
            self.ctx.sync.sync_queue(q)
        };

        if used >= self.ctx.config.output_scan_threshold() || rc.is_err() {
            q.schedule();
        } else {
            let deadline = self.ctx.clock.now() + self.ctx.config.output_submit_timer();
            q.timer().arm_if_idle(deadline);
        }
        rc
    }
}

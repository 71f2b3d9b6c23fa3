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

//! Inbound frontier engine.
//!
//! The adapter fills buffers software handed it (`CuInputEmpty`) and flips them to
//! `InputPrimed`. The engine walks forward from `first_to_check` over primed and
//! errored runs, takes them back, and keeps the newest consumed slot acknowledged
//! while it polls so the adapter knows older ones may be reused. When polling ends
//! the acknowledgement is withdrawn.

use log::{debug, trace, warn};
#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use crate::LOG_TARGET;
use crate::adapter::Capabilities;
use crate::error::{ErrorFlags, ProtocolViolation, QdioError};
use crate::queue::{EngineContext, EngineState, Queue};
use crate::slsb::SlsbState;
use crate::stats::PerfEvent;

pub struct InboundEngine<'a> {
    ctx: EngineContext<'a>,
}

impl<'a> InboundEngine<'a> {
    pub fn new(ctx: EngineContext<'a>) -> Self {
        Self { ctx }
    }

    fn batched(&self) -> bool {
        self.ctx.store.is_batched()
    }

    /// Consume every primed or errored run between `first_to_check` and the
    /// in-flight limit. Returns the new `first_to_check`.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn advance_frontier(&self, q: &Queue) -> Result<usize, QdioError> {
        let cursor = q.cursor();
        let mut ftc = cursor.first_to_check();
        let stop = cursor.add(ftc, cursor.scan_limit());
        let auto_ack = self.batched();

        while ftc != stop {
            let remaining = cursor.sub(stop, ftc);
            let Some(run) = self.ctx.store.get_states(q, ftc, remaining, auto_ack)? else {
                break;
            };
            match run.state {
                SlsbState::InputPrimed => {
                    trace!(target: LOG_TARGET, "{:?}: in prim {}:{}", q.id(), ftc, run.count);
                    self.ack_primed(q, ftc, run.count)?;
                    ftc = cursor.add(ftc, run.count);
                    cursor.set_first_to_check(ftc);
                    if cursor.release(q.id(), run.count)? == 0 {
                        q.stats().inc(PerfEvent::QueueFull);
                    }
                    q.stats().add(PerfEvent::BuffersProcessed, run.count as u64);
                }
                SlsbState::InputError => {
                    warn!(target: LOG_TARGET, "{:?}: in err {}:{}", q.id(), ftc, run.count);
                    q.raise(ErrorFlags::SLSB_STATE);
                    q.stats().inc(PerfEvent::ErrorRun);
                    ftc = cursor.add(ftc, run.count);
                    cursor.set_first_to_check(ftc);
                    cursor.release(q.id(), run.count)?;
                    q.stats().add(PerfEvent::BuffersProcessed, run.count as u64);
                }
                SlsbState::CuInputEmpty | SlsbState::InputNotInit | SlsbState::InputAck => {
                    trace!(target: LOG_TARGET, "{:?}: in nop {}", q.id(), ftc);
                    q.stats().inc(PerfEvent::NopRun);
                    break;
                }
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
        }
        Ok(ftc)
    }

    /// Install the acknowledgement for a primed run of `count` slots at `start`.
    fn ack_primed(&self, q: &Queue, start: usize, count: usize) -> Result<(), QdioError> {
        let store = self.ctx.store;
        let cursor = q.cursor();
        let mut ack = q.ack.lock();

        if self.batched() {
            // the extract already acked the whole run
            if ack.polling {
                store.set_states(q, ack.start, SlsbState::InputNotInit, ack.count)?;
            } else {
                ack.polling = true;
                debug!(target: LOG_TARGET, "{:?}: start polling", q.id());
            }
            ack.start = start;
            ack.count = count;
            return Ok(());
        }

        // ack the newest buffer, release the rest
        let newest = cursor.add(start, count - 1);
        store.set_state(q, newest, SlsbState::InputAck)?;
        if ack.polling {
            store.set_state(q, ack.start, SlsbState::InputNotInit)?;
        } else {
            ack.polling = true;
            debug!(target: LOG_TARGET, "{:?}: start polling", q.id());
        }
        ack.start = newest;
        ack.count = 1;
        if count > 1 {
            store.set_states(q, start, SlsbState::InputNotInit, count - 1)?;
        }
        Ok(())
    }

    /// Advance the frontier and report whether the handler has anything to see.
    pub fn queue_moved(&self, q: &Queue, st: &mut EngineState) -> Result<bool, QdioError> {
        let ftc = self.advance_frontier(q)?;
        let cursor = q.cursor();
        if ftc != cursor.last_move() || q.has_errors() {
            cursor.set_last_move(ftc);
            if !self.ctx.capabilities.contains(Capabilities::NO_INPUT_POLLING) {
                st.timestamp = self.ctx.clock.now();
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether polling may stop.
    pub fn queue_done(&self, q: &Queue, st: &EngineState) -> Result<bool, QdioError> {
        let cursor = q.cursor();
        if cursor.in_flight() == 0 {
            return Ok(true);
        }

        if let Err(err) = self.ctx.sync.sync_queue(q) {
            // the state read below still tells us something
            trace!(target: LOG_TARGET, "{:?}: sync before done check failed: {}", q.id(), err);
        }
        let ftc = cursor.first_to_check();
        match self.ctx.store.get_state(q, ftc)? {
            SlsbState::InputPrimed | SlsbState::InputError => return Ok(false),
            _ => {}
        }

        if self
            .ctx
            .capabilities
            .contains(Capabilities::NO_INPUT_POLLING)
        {
            return Ok(true);
        }

        let idle = self.ctx.clock.now().saturating_sub(st.timestamp);
        if idle > self.ctx.config.input_poll_threshold() {
            trace!(target: LOG_TARGET, "{:?}: in done {}", q.id(), ftc);
            return Ok(true);
        }
        Ok(false)
    }

    /// Withdraw the outstanding acknowledgement. Returns whether polling was on.
    pub fn stop_polling(&self, q: &Queue) -> Result<bool, QdioError> {
        let mut ack = q.ack.lock();
        if !ack.polling {
            return Ok(false);
        }
        ack.polling = false;
        q.stats().inc(PerfEvent::StopPolling);
        debug!(target: LOG_TARGET, "{:?}: stop polling", q.id());

        let (start, count) = (ack.start, ack.count);
        ack.count = 0;
        if self.batched() {
            self.ctx
                .store
                .set_states(q, start, SlsbState::InputNotInit, count)?;
        } else {
            self.ctx.store.set_state(q, start, SlsbState::InputNotInit)?;
        }
        Ok(true)
    }

    /// Give `count` buffers at `start` back to the adapter.
    #[cfg_attr(feature = "tracing", instrument(skip_all, parent = Span::current(), level= "Trace"))]
    pub fn handle_submit(&self, q: &Queue, start: usize, count: usize) -> Result<(), QdioError> {
        let cursor = q.cursor();
        q.stats().inc(PerfEvent::Submit);

        let set = {
            let mut ack = q.ack.lock();
            if ack.polling {
                if count == cursor.buffer_count() {
                    ack.polling = false;
                    ack.count = 0;
                } else if cursor.buf_in_between(ack.start, start, count) {
                    if self.batched() {
                        // drop the acked slots this submit overwrites
                        let end = cursor.add(start, count);
                        let diff = cursor.sub(end, ack.start);
                        if diff >= ack.count {
                            ack.polling = false;
                            ack.count = 0;
                        } else {
                            ack.count -= diff;
                            ack.start = cursor.add(ack.start, diff);
                        }
                    } else {
                        // the only ack is about to be overwritten
                        ack.polling = false;
                        ack.count = 0;
                    }
                }
            }
            self.ctx
                .store
                .set_states(q, start, SlsbState::CuInputEmpty, count)?
        };

        let before = cursor.claim(q.id(), set)?;
        if before != 0 {
            return Ok(());
        }
        if self
            .ctx
            .capabilities
            .contains(Capabilities::INPUT_DOORBELL)
        {
            q.stats().inc(PerfEvent::SigaRead);
            match self.ctx.adapter.signal_input(q.id()) {
                0 => {}
                cc => {
                    warn!(target: LOG_TARGET, "{:?}: input doorbell failed, cc {}", q.id(), cc);
                    return Err(QdioError::SigaFailed { cc });
                }
            }
        }
        Ok(())
    }
}

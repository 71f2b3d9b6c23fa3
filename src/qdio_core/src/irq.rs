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

//! Channel state machine.
//!
//! ```text
//! Inactive -> Cleanup -> Established -> Active
//!                |            |            |
//!                v            v            v
//!              Error    Error|Stopped  Error|Stopped
//!
//! any state but Inactive -> Cleanup -> Inactive      (shutdown)
//! Error|Stopped -> Inactive
//! ```
//!
//! The state is read without a lock at the start of every engine pass and again
//! before every handler callout. A transition to Error or Stopped racing with a
//! pass that already checked can let that one pass finish; the next one is a no-op.

use core::sync::atomic::{AtomicU8, Ordering};

use log::debug;

use crate::LOG_TARGET;
use crate::error::QdioError;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrqState {
    Inactive = 0,
    Cleanup = 1,
    Established = 2,
    Active = 3,
    Stopped = 4,
    Error = 5,
}

impl IrqState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => IrqState::Inactive,
            1 => IrqState::Cleanup,
            2 => IrqState::Established,
            3 => IrqState::Active,
            4 => IrqState::Stopped,
            _ => IrqState::Error,
        }
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub const fn can_transition_to(self, to: IrqState) -> bool {
        use IrqState::*;
        matches!(
            (self, to),
            (Inactive, Cleanup)
                | (Cleanup, Established | Inactive | Error)
                | (Established, Active | Error | Stopped | Cleanup)
                | (Active, Error | Stopped | Cleanup)
                | (Error | Stopped, Cleanup | Inactive)
        )
    }
}

#[derive(Debug)]
pub struct IrqStateMachine {
    state: AtomicU8,
}

impl IrqStateMachine {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(IrqState::Inactive as u8),
        }
    }

    #[inline]
    pub fn state(&self) -> IrqState {
        IrqState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Engines may run.
    #[inline]
    pub fn engines_may_run(&self) -> bool {
        matches!(self.state(), IrqState::Established | IrqState::Active)
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.state() == IrqState::Active
    }

    /// Move to `to`. Returns the previous state.
    pub fn transition(&self, to: IrqState) -> Result<IrqState, QdioError> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = IrqState::from_u8(current);
            if !from.can_transition_to(to) {
                return Err(QdioError::InvalidTransition { from, to });
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(target: LOG_TARGET, "channel {:?} -> {:?}", from, to);
                    return Ok(from);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Move to Error or Stopped from wherever that is allowed. Returns the
    /// previous state, or `None` when the channel was already down.
    pub fn fail(&self, to: IrqState) -> Option<IrqState> {
        self.transition(to).ok()
    }
}

impl Default for IrqStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

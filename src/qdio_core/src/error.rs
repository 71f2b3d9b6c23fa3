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

use bitflags::bitflags;
use thiserror::Error;

use crate::adapter::QueueId;
use crate::irq::IrqState;

bitflags! {
    /// Error conditions recorded on a queue and reported with the next handler
    /// callout.
    ///
    /// A non-zero value does not mean the whole reported range failed, only that
    /// at least one slot in it did. The upper layer has to look at its own buffer
    /// descriptors to find which one.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ErrorFlags: u32 {
        /// At least one slot in the range was handed back in the error state.
        const SLSB_STATE     = 1 << 0;
        /// The channel hit an activate check condition or another control-path
        /// error. Reported once, without a buffer range.
        const ACTIVATE_CHECK = 1 << 1;
        /// The output doorbell stayed busy for the whole patience window.
        const SIGA_BUSY      = 1 << 2;
        /// The output doorbell failed with a hard condition code.
        const SIGA_ERROR     = 1 << 3;
        /// A batched state extract failed.
        const GET_BUF_STATE  = 1 << 4;
        /// A batched state set failed.
        const SET_BUF_STATE  = 1 << 5;
    }
}

/// Failures of the control path that drives the channel state machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlError {
    #[error("control operation timed out")]
    Timeout,
    #[error("activate check condition")]
    ActivateCheck,
    #[error("subchannel I/O error (cc {cc})")]
    IoError { cc: u8 },
}

/// A broken single-writer discipline between software and the adapter.
///
/// Continuing after one of these risks corrupting the ring indices, so the
/// channel is moved to [`IrqState::Error`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("unexpected buffer state {state:#04x} at slot {index}")]
    UnexpectedState { index: usize, state: u8 },
    #[error("in-flight count {used} outside 0..={buffer_count}")]
    InFlightOutOfRange { used: i32, buffer_count: usize },
}

/// The error type for channel and queue operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QdioError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Submit flags must name exactly one direction")]
    Invalid,
    #[error("Channel is not active (state {0:?})")]
    NotActive(IrqState),
    #[error("Invalid channel state transition {from:?} -> {to:?}")]
    InvalidTransition { from: IrqState, to: IrqState },
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("Batched state extract failed (ccq {ccq})")]
    GetBufState { ccq: u8 },
    #[error("Batched state set failed (ccq {ccq})")]
    SetBufState { ccq: u8 },
    #[error("Batched state operation made no progress after {0} retries")]
    BatchStalled(u32),
    #[error("Adapter busy")]
    SigaBusy,
    #[error("Signal adapter failed (cc {cc})")]
    SigaFailed { cc: u8 },
    #[error("Protocol violation on {queue:?}: {violation}")]
    ProtocolViolation {
        queue: QueueId,
        violation: ProtocolViolation,
    },
    #[error("Control operation failed: {0}")]
    Control(#[from] ControlError),
}

impl QdioError {
    /// The sticky flag an engine records for this error, if any.
    pub fn error_flags(&self) -> ErrorFlags {
        match self {
            QdioError::GetBufState { .. } | QdioError::BatchStalled(_) => ErrorFlags::GET_BUF_STATE,
            QdioError::SetBufState { .. } => ErrorFlags::SET_BUF_STATE,
            QdioError::SigaBusy => ErrorFlags::SIGA_BUSY,
            QdioError::SigaFailed { .. } => ErrorFlags::SIGA_ERROR,
            QdioError::Control(_) => ErrorFlags::ACTIVATE_CHECK,
            _ => ErrorFlags::empty(),
        }
    }

    /// Whether this error means the ring discipline was broken.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QdioError::ProtocolViolation { .. })
    }

    pub(crate) fn violation(queue: QueueId, violation: ProtocolViolation) -> Self {
        QdioError::ProtocolViolation { queue, violation }
    }
}

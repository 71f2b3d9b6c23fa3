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

use core::cmp::{max, min};
use core::time::Duration;

use crate::error::QdioError;
use crate::{MAX_BUFFERS_PER_QUEUE, MAX_QUEUES_PER_DIRECTION};

/// The complete set of configuration needed to establish a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelConfiguration {
    /// Slots per queue. Always a power of two.
    buffer_count: usize,
    input_queues: usize,
    output_queues: usize,
    /// How long an inbound queue keeps polling after its frontier last moved.
    input_poll_threshold: Duration,
    /// How long the output doorbell is retried while the adapter reports busy.
    busy_patience: Duration,
    /// In-flight outbound buffers at which a submit schedules a scan right away.
    output_scan_threshold: usize,
    /// Safety-net timer armed by a submit that did not schedule a scan.
    output_submit_timer: Duration,
    /// Timer armed after a scan that left buffers in flight.
    output_idle_timer: Duration,
    /// In-flight outbound buffers above which a scan reschedules itself.
    output_poll_level: usize,
    /// Retries of a batched state operation that makes no progress.
    batch_retry_limit: u32,
}

impl ChannelConfiguration {
    /// The default ring size
    pub const DEFAULT_BUFFER_COUNT: usize = MAX_BUFFERS_PER_QUEUE;
    /// The minimum ring size
    pub const MIN_BUFFER_COUNT: usize = 2;
    /// The maximum ring size
    pub const MAX_BUFFER_COUNT: usize = MAX_BUFFERS_PER_QUEUE;
    /// The default inbound polling threshold (500µs)
    pub const DEFAULT_INPUT_POLL_THRESHOLD: Duration = Duration::from_micros(500);
    /// The minimum inbound polling threshold
    pub const MIN_INPUT_POLL_THRESHOLD: Duration = Duration::from_micros(1);
    /// The maximum inbound polling threshold
    pub const MAX_INPUT_POLL_THRESHOLD: Duration = Duration::from_millis(100);
    /// The default doorbell patience window (100µs)
    pub const DEFAULT_BUSY_PATIENCE: Duration = Duration::from_micros(100);
    /// The minimum doorbell patience window
    pub const MIN_BUSY_PATIENCE: Duration = Duration::from_micros(1);
    /// The maximum doorbell patience window
    pub const MAX_BUSY_PATIENCE: Duration = Duration::from_millis(10);
    /// The default outbound scan threshold
    pub const DEFAULT_OUTPUT_SCAN_THRESHOLD: usize = 64;
    /// The default delay of the timer armed by an outbound submit (1s)
    pub const DEFAULT_OUTPUT_SUBMIT_TIMER: Duration = Duration::from_secs(1);
    /// The default delay of the timer armed after an outbound scan (10s)
    pub const DEFAULT_OUTPUT_IDLE_TIMER: Duration = Duration::from_secs(10);
    /// The minimum delay of either outbound timer
    pub const MIN_OUTPUT_TIMER: Duration = Duration::from_micros(1);
    /// The maximum delay of either outbound timer
    pub const MAX_OUTPUT_TIMER: Duration = Duration::from_secs(60);
    /// The default outbound poll level
    pub const DEFAULT_OUTPUT_POLL_LEVEL: usize = 65;
    /// The default retry limit of batched state operations
    pub const DEFAULT_BATCH_RETRY_LIMIT: u32 = 32;
    /// The maximum retry limit of batched state operations
    pub const MAX_BATCH_RETRY_LIMIT: u32 = 4096;

    /// Create a configuration with `input_queues` inbound and `output_queues`
    /// outbound queues and every other value at its default.
    pub fn new(input_queues: usize, output_queues: usize) -> Self {
        Self {
            buffer_count: Self::DEFAULT_BUFFER_COUNT,
            input_queues: min(input_queues, MAX_QUEUES_PER_DIRECTION),
            output_queues: min(output_queues, MAX_QUEUES_PER_DIRECTION),
            input_poll_threshold: Self::DEFAULT_INPUT_POLL_THRESHOLD,
            busy_patience: Self::DEFAULT_BUSY_PATIENCE,
            output_scan_threshold: Self::DEFAULT_OUTPUT_SCAN_THRESHOLD,
            output_submit_timer: Self::DEFAULT_OUTPUT_SUBMIT_TIMER,
            output_idle_timer: Self::DEFAULT_OUTPUT_IDLE_TIMER,
            output_poll_level: Self::DEFAULT_OUTPUT_POLL_LEVEL,
            batch_retry_limit: Self::DEFAULT_BATCH_RETRY_LIMIT,
        }
    }

    /// Set the ring size. If set to 0, the ring size will be set to
    /// `DEFAULT_BUFFER_COUNT`. Other values are clamped to
    /// `MIN_BUFFER_COUNT..=MAX_BUFFER_COUNT` and rounded down to a power of two.
    pub fn set_buffer_count(&mut self, buffer_count: usize) {
        self.buffer_count = match buffer_count {
            0 => Self::DEFAULT_BUFFER_COUNT,
            1.. => {
                let clamped = min(
                    Self::MAX_BUFFER_COUNT,
                    max(buffer_count, Self::MIN_BUFFER_COUNT),
                );
                // round down to a power of two
                1 << (usize::BITS - 1 - clamped.leading_zeros())
            }
        };
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn input_queues(&self) -> usize {
        self.input_queues
    }

    pub fn output_queues(&self) -> usize {
        self.output_queues
    }

    /// Set the inbound polling threshold. If set to 0 it falls back to
    /// `DEFAULT_INPUT_POLL_THRESHOLD`.
    pub fn set_input_poll_threshold(&mut self, threshold: Duration) {
        self.input_poll_threshold = clamp_duration(
            threshold,
            Self::DEFAULT_INPUT_POLL_THRESHOLD,
            Self::MIN_INPUT_POLL_THRESHOLD,
            Self::MAX_INPUT_POLL_THRESHOLD,
        );
    }

    pub fn input_poll_threshold(&self) -> Duration {
        self.input_poll_threshold
    }

    /// Set the doorbell patience window. If set to 0 it falls back to
    /// `DEFAULT_BUSY_PATIENCE`.
    pub fn set_busy_patience(&mut self, patience: Duration) {
        self.busy_patience = clamp_duration(
            patience,
            Self::DEFAULT_BUSY_PATIENCE,
            Self::MIN_BUSY_PATIENCE,
            Self::MAX_BUSY_PATIENCE,
        );
    }

    pub fn busy_patience(&self) -> Duration {
        self.busy_patience
    }

    /// Set the outbound scan threshold. 0 falls back to the default, larger values
    /// are capped at the ring size when the channel is established.
    pub fn set_output_scan_threshold(&mut self, threshold: usize) {
        self.output_scan_threshold = match threshold {
            0 => Self::DEFAULT_OUTPUT_SCAN_THRESHOLD,
            n => n,
        };
    }

    pub fn output_scan_threshold(&self) -> usize {
        min(self.output_scan_threshold, self.buffer_count)
    }

    pub fn set_output_submit_timer(&mut self, delay: Duration) {
        self.output_submit_timer = clamp_duration(
            delay,
            Self::DEFAULT_OUTPUT_SUBMIT_TIMER,
            Self::MIN_OUTPUT_TIMER,
            Self::MAX_OUTPUT_TIMER,
        );
    }

    pub fn output_submit_timer(&self) -> Duration {
        self.output_submit_timer
    }

    pub fn set_output_idle_timer(&mut self, delay: Duration) {
        self.output_idle_timer = clamp_duration(
            delay,
            Self::DEFAULT_OUTPUT_IDLE_TIMER,
            Self::MIN_OUTPUT_TIMER,
            Self::MAX_OUTPUT_TIMER,
        );
    }

    pub fn output_idle_timer(&self) -> Duration {
        self.output_idle_timer
    }

    /// Set the outbound poll level. 0 falls back to the default.
    pub fn set_output_poll_level(&mut self, level: usize) {
        self.output_poll_level = match level {
            0 => Self::DEFAULT_OUTPUT_POLL_LEVEL,
            n => n,
        };
    }

    pub fn output_poll_level(&self) -> usize {
        self.output_poll_level
    }

    /// Set the retry limit of batched state operations, capped at
    /// `MAX_BATCH_RETRY_LIMIT`. 0 falls back to the default.
    pub fn set_batch_retry_limit(&mut self, limit: u32) {
        self.batch_retry_limit = match limit {
            0 => Self::DEFAULT_BATCH_RETRY_LIMIT,
            n => min(n, Self::MAX_BATCH_RETRY_LIMIT),
        };
    }

    pub fn batch_retry_limit(&self) -> u32 {
        self.batch_retry_limit
    }

    /// Check what the setters cannot enforce on their own.
    pub fn validate(&self) -> Result<(), QdioError> {
        if self.input_queues + self.output_queues == 0 {
            return Err(QdioError::InvalidConfiguration(
                "a channel needs at least one queue",
            ));
        }
        if !self.buffer_count.is_power_of_two() {
            return Err(QdioError::InvalidConfiguration(
                "buffer count must be a power of two",
            ));
        }
        Ok(())
    }
}

impl Default for ChannelConfiguration {
    /// One inbound and one outbound queue.
    fn default() -> Self {
        Self::new(1, 1)
    }
}

fn clamp_duration(value: Duration, default: Duration, lo: Duration, hi: Duration) -> Duration {
    if value.is_zero() {
        default
    } else {
        min(hi, max(value, lo))
    }
}

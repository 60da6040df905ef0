//! Retry/backoff state machine for alarm delivery.
//!
//! ```text
//! PENDING → SENDING → DELIVERED
//!                   → RETRY_SCHEDULED → (promoted) → PENDING
//!                   → DROPPED
//! ```
//!
//! Retries are not slept on by the worker; they go back through the delayed
//! queue so the worker pool stays the only place deliveries run.

use std::time::Duration;

use herald_common::types::AlarmMessage;

/// Longest delay between two attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delivery lifecycle of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sending,
    Delivered,
    RetryScheduled { retry_count: u32, delay: Duration },
    Dropped,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Dropped)
    }
}

/// Delay before retry number `retry_count` (1-based): 1s, 2s, 4s, ... capped at 30s.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exponent).min(MAX_BACKOFF)
}

/// Next state after a failed send. Bumps `retry_count` when a retry is left.
pub fn on_failure(message: &mut AlarmMessage) -> DeliveryState {
    if message.retry_count >= message.max_retry {
        return DeliveryState::Dropped;
    }

    message.retry_count += 1;
    DeliveryState::RetryScheduled {
        retry_count: message.retry_count,
        delay: backoff_delay(message.retry_count),
    }
}

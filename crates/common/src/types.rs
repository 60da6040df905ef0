use serde::{Deserialize, Serialize};

/// Threshold applied when a filter rule carries no positive cooldown count.
pub const DEFAULT_COOLDOWN_THRESHOLD: i64 = 50;

/// The text handed to the outbound sender for one alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmTextMessage {
    pub trace_id: String,
    pub operation: String,
    pub title: String,
    pub info: String,
}

/// The unit of work flowing through the dispatch queues.
///
/// Serialized as a flat JSON object: the text fields sit next to the
/// platform and retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmMessage {
    /// Outbound channel (webhook) name
    pub platform: String,
    #[serde(flatten)]
    pub text: AlarmTextMessage,
    /// Failed delivery attempts so far
    #[serde(default)]
    pub retry_count: u32,
    /// Retry ceiling, fixed when the message is created
    #[serde(default)]
    pub max_retry: u32,
}

impl AlarmMessage {
    pub fn new(platform: impl Into<String>, text: AlarmTextMessage, max_retry: u32) -> Self {
        Self {
            platform: platform.into(),
            text,
            retry_count: 0,
            max_retry,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.text.trace_id
    }
}

/// A suppression rule: alarms containing `msg` are counted and fused once
/// they repeat `cooldown_times` times inside the cooldown window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FilterRule {
    /// Substring searched for in the alarm text
    pub msg: String,
    /// Repeats tolerated before fusing
    pub cooldown_times: i64,
}

impl FilterRule {
    pub fn new(msg: impl Into<String>, cooldown_times: i64) -> Self {
        Self {
            msg: msg.into(),
            cooldown_times,
        }
    }

    /// Threshold with non-positive values mapped to the default.
    pub fn threshold(&self) -> i64 {
        if self.cooldown_times <= 0 {
            DEFAULT_COOLDOWN_THRESHOLD
        } else {
            self.cooldown_times
        }
    }
}

/// Caller-side request metadata attached to an alarm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendContext {
    pub trace_id: Option<String>,
    pub operation: Option<String>,
}

impl SendContext {
    pub fn new(trace_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            operation: Some(operation.into()),
        }
    }

    /// Trace id from the caller, or a fresh UUID when there is none.
    pub fn trace_id_or_new(&self) -> String {
        self.trace_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }

    /// Operation from the caller, or `fallback` when there is none.
    pub fn operation_or(&self, fallback: &str) -> String {
        self.operation
            .as_deref()
            .filter(|op| !op.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

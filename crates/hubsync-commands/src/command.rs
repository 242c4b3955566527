//! Command types: write intents, per-command state, speed tiers and retries.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hubsync_core::config::DispatchConfig;
use hubsync_devices::{IoDelta, RawIo, TYPE_OFF, TYPE_ON, TYPE_SET_VALUE};

use crate::error::{DispatchError, FailureKind, WireError};

/// Command identifier.
pub type CommandId = String;

/// A single IO write intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub hub_id: String,
    pub device_id: String,
    pub io_key: String,
    pub raw_type: i64,
    pub raw_val: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Ask the device to keep the value across power loss.
    #[serde(default)]
    pub durable: bool,
}

impl Command {
    pub fn new(
        hub_id: impl Into<String>,
        device_id: impl Into<String>,
        io_key: impl Into<String>,
        raw_type: i64,
        raw_val: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hub_id: hub_id.into(),
            device_id: device_id.into(),
            io_key: io_key.into(),
            raw_type,
            raw_val,
            tag: None,
            durable: false,
        }
    }

    pub fn turn_on(
        hub_id: impl Into<String>,
        device_id: impl Into<String>,
        io_key: impl Into<String>,
    ) -> Self {
        Self::new(hub_id, device_id, io_key, TYPE_ON, 1)
    }

    pub fn turn_off(
        hub_id: impl Into<String>,
        device_id: impl Into<String>,
        io_key: impl Into<String>,
    ) -> Self {
        Self::new(hub_id, device_id, io_key, TYPE_OFF, 0)
    }

    pub fn set_value(
        hub_id: impl Into<String>,
        device_id: impl Into<String>,
        io_key: impl Into<String>,
        value: i64,
    ) -> Self {
        Self::new(hub_id, device_id, io_key, TYPE_SET_VALUE, value)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Delta the device store should see once this write has landed.
    pub fn to_delta(&self) -> IoDelta {
        IoDelta::new(
            self.hub_id.clone(),
            self.device_id.clone(),
            self.io_key.clone(),
            RawIo::new(self.raw_type, self.raw_val),
        )
    }
}

/// Lifecycle of one command inside a batch.
///
/// `Pending → InFlight → {Acknowledged | Failed}`; `Failed` moves on to
/// `Retrying` or ends in `Abandoned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    InFlight,
    Acknowledged,
    Failed,
    Retrying,
    Abandoned,
    /// Cancelled before any wire call was issued.
    Cancelled,
    /// Sent by the extreme tier; outcome unknown.
    Submitted,
}

impl CommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandState::Acknowledged
                | CommandState::Abandoned
                | CommandState::Cancelled
                | CommandState::Submitted
        )
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandState::Pending => "pending",
            CommandState::InFlight => "in_flight",
            CommandState::Acknowledged => "acknowledged",
            CommandState::Failed => "failed",
            CommandState::Retrying => "retrying",
            CommandState::Abandoned => "abandoned",
            CommandState::Cancelled => "cancelled",
            CommandState::Submitted => "submitted",
        };
        f.write_str(s)
    }
}

/// Delivery policy chosen per batch.
///
/// Only `Normal` preserves submission order within a hub. `Fast` and
/// `Extreme` send the batch in one call and make no ordering promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedTier {
    /// Sequential, each write acknowledged before the next; retried.
    #[default]
    Normal,
    /// One unacknowledged batch pass, then an acknowledged pass for stragglers.
    Fast,
    /// One unacknowledged batch pass; no retries, no guarantee.
    Extreme,
}

impl SpeedTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpeedTier::Normal => "normal",
            SpeedTier::Fast => "fast",
            SpeedTier::Extreme => "extreme",
        }
    }
}

impl fmt::Display for SpeedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeedTier {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(SpeedTier::Normal),
            "fast" => Ok(SpeedTier::Fast),
            "extreme" => Ok(SpeedTier::Extreme),
            other => Err(DispatchError::UnknownTier(other.to_string())),
        }
    }
}

/// Retry policy for normal and fast tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Initial retry delay in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.initial_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    /// Whether a command that has made `attempts` attempts may try again.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }
}

impl From<&DispatchConfig> for RetryPolicy {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay_ms: config.retry_initial_delay_ms,
            backoff_multiplier: config.retry_multiplier,
            max_delay_ms: config.retry_max_delay_ms,
        }
    }
}

/// Why a command did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    pub message: String,
}

impl From<&WireError> for CommandFailure {
    fn from(e: &WireError) -> Self {
        Self {
            kind: e.kind(),
            code: e.code(),
            message: e.to_string(),
        }
    }
}

/// Per-command bookkeeping while a batch is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Command,
    pub state: CommandState,
    /// Wire attempts made, including the first.
    pub attempts: u32,
    /// Pass that decided the outcome (fast tier: 1 or 2).
    pub pass: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<CommandFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl CommandRecord {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            state: CommandState::Pending,
            attempts: 0,
            pass: 0,
            failure: None,
            acknowledged_at: None,
        }
    }

    /// Whether no wire call has been issued yet.
    pub fn is_untouched(&self) -> bool {
        self.attempts == 0
    }

    pub fn start_attempt(&mut self, pass: u8) {
        self.attempts += 1;
        self.pass = pass;
        self.state = CommandState::InFlight;
    }

    pub fn acknowledge(&mut self) {
        self.state = CommandState::Acknowledged;
        self.failure = None;
        self.acknowledged_at = Some(Utc::now());
    }

    /// Record a failed attempt. The record stays `Failed` until the caller
    /// moves it on with [`retry`](Self::retry) or [`abandon`](Self::abandon).
    pub fn fail(&mut self, error: &WireError) {
        self.failure = Some(CommandFailure::from(error));
        self.state = CommandState::Failed;
    }

    pub fn retry(&mut self) {
        self.state = CommandState::Retrying;
    }

    /// Give up; the last failure is kept.
    pub fn abandon(&mut self) {
        self.state = CommandState::Abandoned;
    }

    /// Acknowledged but not visibly effective; queue for another pass.
    pub fn requeue(&mut self) {
        self.state = CommandState::Retrying;
        self.acknowledged_at = None;
    }

    pub fn cancel(&mut self) {
        self.state = CommandState::Cancelled;
    }

    pub fn submit(&mut self) {
        self.state = CommandState::Submitted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helpers_encode_parity() {
        let on = Command::turn_on("A1", "d1", "L1");
        assert_eq!((on.raw_type, on.raw_val), (0x81, 1));
        let off = Command::turn_off("A1", "d1", "L1");
        assert_eq!((off.raw_type, off.raw_val), (0x80, 0));
        let set = Command::set_value("A1", "d1", "P1", 50).with_tag("dim").durable();
        assert_eq!((set.raw_type, set.raw_val), (0xCF, 50));
        assert!(set.durable);
        assert_ne!(on.id, off.id);
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("FAST".parse::<SpeedTier>().unwrap(), SpeedTier::Fast);
        assert!("ludicrous".parse::<SpeedTier>().is_err());
        assert_eq!(SpeedTier::default(), SpeedTier::Normal);
    }

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(5000));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
        assert!(!RetryPolicy::none().allows(1));
    }

    #[test]
    fn test_record_transitions() {
        let mut record = CommandRecord::new(Command::turn_on("A1", "d1", "L1"));
        assert!(record.is_untouched());

        record.start_attempt(1);
        assert_eq!(record.state, CommandState::InFlight);
        record.fail(&WireError::Timeout("10s".into()));
        assert_eq!(record.state, CommandState::Failed);
        assert!(!record.state.is_terminal());
        assert_eq!(record.failure.as_ref().unwrap().kind, FailureKind::Unreachable);
        record.retry();
        assert_eq!(record.state, CommandState::Retrying);

        record.start_attempt(2);
        record.acknowledge();
        assert_eq!(record.state, CommandState::Acknowledged);
        assert!(record.failure.is_none());
        assert_eq!(record.attempts, 2);
        assert!(record.state.is_terminal());
    }

    #[test]
    fn test_abandon_keeps_last_failure() {
        let mut record = CommandRecord::new(Command::turn_on("A1", "d1", "L1"));
        record.start_attempt(1);
        record.fail(&WireError::Rejected {
            code: 10001,
            message: "bad idx".into(),
        });
        assert_eq!(record.state, CommandState::Failed);
        record.abandon();
        assert_eq!(record.state, CommandState::Abandoned);
        assert!(record.state.is_terminal());
        assert_eq!(record.failure.as_ref().unwrap().kind, FailureKind::Rejected);
    }
}

//! Ports between the dispatcher and the wire.

use async_trait::async_trait;

use crate::command::{Command, SpeedTier};
use crate::error::WireError;

/// Sends writes to hubs.
///
/// `write` returns once the server has acknowledged the single write.
/// `write_batch` sends many commands for one hub in a single call and
/// returns one result per command, in order; a failed item never fails the
/// others.
#[async_trait]
pub trait HubWriter: Send + Sync {
    async fn write(&self, command: &Command) -> Result<(), WireError>;

    async fn write_batch(
        &self,
        _hub_id: &str,
        commands: &[Command],
        _tier: SpeedTier,
    ) -> Vec<Result<(), WireError>> {
        futures::future::join_all(commands.iter().map(|c| self.write(c))).await
    }
}

/// Tells whether an acknowledged write is visible in device state.
///
/// `None` means the probe cannot tell (unknown device or IO).
pub trait EffectProbe: Send + Sync {
    fn has_taken_effect(&self, command: &Command) -> Option<bool>;
}

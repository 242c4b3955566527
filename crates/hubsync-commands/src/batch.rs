//! Command batches and their outcome.

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandRecord, CommandState, SpeedTier};
use crate::error::DispatchError;

/// Commands for one hub dispatched together under one tier.
#[derive(Debug, Clone)]
pub struct CommandBatch {
    pub id: String,
    pub hub_id: String,
    pub tier: SpeedTier,
    pub records: Vec<CommandRecord>,
}

impl CommandBatch {
    pub fn new(
        hub_id: impl Into<String>,
        commands: Vec<Command>,
        tier: SpeedTier,
    ) -> Result<Self, DispatchError> {
        let hub_id = hub_id.into();
        if commands.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }
        if let Some(stray) = commands.iter().find(|c| c.hub_id != hub_id) {
            return Err(DispatchError::HubMismatch {
                expected: hub_id,
                found: stray.hub_id.clone(),
            });
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            hub_id,
            tier,
            records: commands.into_iter().map(CommandRecord::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_outcome(self) -> BatchOutcome {
        BatchOutcome {
            batch_id: self.id,
            hub_id: self.hub_id,
            tier: self.tier,
            records: self.records,
        }
    }
}

/// Final state of every command in a batch, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub hub_id: String,
    pub tier: SpeedTier,
    pub records: Vec<CommandRecord>,
}

impl BatchOutcome {
    fn in_state(&self, state: CommandState) -> Vec<&CommandRecord> {
        self.records.iter().filter(|r| r.state == state).collect()
    }

    pub fn acknowledged(&self) -> Vec<&CommandRecord> {
        self.in_state(CommandState::Acknowledged)
    }

    /// Commands that did not succeed, each carrying its failure.
    pub fn failed(&self) -> Vec<&CommandRecord> {
        self.in_state(CommandState::Abandoned)
    }

    pub fn cancelled(&self) -> Vec<&CommandRecord> {
        self.in_state(CommandState::Cancelled)
    }

    pub fn submitted(&self) -> Vec<&CommandRecord> {
        self.in_state(CommandState::Submitted)
    }

    pub fn record(&self, command_id: &str) -> Option<&CommandRecord> {
        self.records.iter().find(|r| r.command.id == command_id)
    }

    /// Every command acknowledged.
    pub fn is_success(&self) -> bool {
        self.records
            .iter()
            .all(|r| r.state == CommandState::Acknowledged)
    }
}

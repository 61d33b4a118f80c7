//! Error taxonomy shared by the pipeline and the daemons.
//!
//! Pipeline code returns [`anyhow::Result`] and attaches a [`HarnessError`] as the root cause
//! whenever the failure belongs to one of the categories below, so that callers can
//! `downcast_ref::<HarnessError>()` to tell them apart.

use alloy_core::primitives::B256;

use crate::pipeline::StageId;

/// Failures the harness knows how to classify.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// A node never answered its liveness query.
    #[error("chain {chain_id} not ready after {attempts} attempts")]
    StartupTimeout { chain_id: u64, attempts: usize },

    /// A stage was invoked before the stage that produces its inputs.
    #[error("{missing} not found, run `relaynet {stage}` first")]
    MissingPrerequisite { stage: StageId, missing: &'static str },

    /// A transaction did not match the expected payload shape.
    #[error("failed to decode transaction {tx_hash}: {reason}")]
    DecodeFailure { tx_hash: B256, reason: String },

    /// An outbound transaction reverted or could not be sent.
    #[error("submission on chain {chain_id} failed: {reason}")]
    SubmissionFailure { chain_id: u64, reason: String },

    /// The named chain is unknown to the component.
    #[error("chain {0} not found")]
    ChainNotFound(u64),
}

impl HarnessError {
    /// Returns `true` for errors a daemon recovers from on its next tick.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DecodeFailure { .. } | Self::SubmissionFailure { .. } | Self::ChainNotFound(_)
        )
    }
}

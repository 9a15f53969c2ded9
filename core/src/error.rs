use crate::types::{BlockRid, NodeId};
use thiserror::Error;

/// Reasons a block could not be appended to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommitError {
	#[error("Blockchain engine is closed")]
	EngineClosed,
	#[error("Storage aborted the transaction: {0}")]
	StorageAbort(String),
	#[error("Previous block mismatch: expected {expected}, received {received}")]
	PrevBlockMismatch {
		expected: BlockRid,
		received: BlockRid,
	},
	#[error("Block is built with a different configuration than the active one")]
	ConfigurationMismatch,
	#[error("Block reports a failed configuration which does not match ours")]
	FailedConfigurationMismatch,
	#[error("Bad block data: {0}")]
	BadData(String),
	#[error("{0}")]
	Other(String),
}

impl CommitError {
	/// Failures which mean the local chain diverged from the remote one.
	pub fn is_fatal(&self) -> bool {
		matches!(self, CommitError::PrevBlockMismatch { .. })
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WitnessError {
	#[error("Witness is for block {witness}, header is {header}")]
	BlockMismatch { header: BlockRid, witness: BlockRid },
	#[error("Signer {0} is not in the signer set")]
	UnknownSigner(NodeId),
	#[error("Invalid signature from {0}")]
	InvalidSignature(NodeId),
	#[error("Insufficient signatures: {valid} of {required} required")]
	InsufficientSignatures { valid: usize, required: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
	#[error("Empty {0}")]
	Empty(&'static str),
	#[error("Cannot decode {what}: {reason}")]
	Invalid { what: &'static str, reason: String },
}

impl DecodeError {
	pub fn invalid(what: &'static str, error: codec::Error) -> Self {
		DecodeError::Invalid {
			what,
			reason: error.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case(CommitError::EngineClosed => false)]
	#[test_case(CommitError::StorageAbort("deadlock".into()) => false)]
	#[test_case(CommitError::PrevBlockMismatch { expected: BlockRid([1; 32]), received: BlockRid([2; 32]) } => true)]
	#[test_case(CommitError::BadData("bad".into()) => false)]
	fn only_prev_block_mismatch_is_fatal(error: CommitError) -> bool {
		error.is_fatal()
	}
}

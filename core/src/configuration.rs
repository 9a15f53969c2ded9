//! Blockchain configuration as seen by the synchronizers.
use crate::{
	error::DecodeError,
	types::{BlockHeader, BlockWitness, ConfigHash, NodeId},
	witness::{BlockHeaderValidator, Quorum},
};
use codec::Decode;
use mockall::automock;

/// Codec and witness validation of the active configuration.
#[automock]
pub trait BlockchainConfiguration: Send + Sync {
	fn chain_id(&self) -> i64;

	fn config_hash(&self) -> ConfigHash;

	fn signers(&self) -> Vec<NodeId>;

	fn decode_block_header(&self, raw: &[u8]) -> Result<BlockHeader, DecodeError>;

	fn decode_witness(&self, raw: &[u8]) -> Result<BlockWitness, DecodeError>;

	fn block_header_validator(&self) -> BlockHeaderValidator;
}

#[derive(Clone, Debug)]
pub struct BaseBlockchainConfiguration {
	pub chain_id: i64,
	pub config_hash: ConfigHash,
	pub signers: Vec<NodeId>,
	pub quorum: Quorum,
}

fn decode<T: Decode>(what: &'static str, raw: &[u8]) -> Result<T, DecodeError> {
	if raw.is_empty() {
		return Err(DecodeError::Empty(what));
	}
	T::decode(&mut &raw[..]).map_err(|error| DecodeError::invalid(what, error))
}

impl BlockchainConfiguration for BaseBlockchainConfiguration {
	fn chain_id(&self) -> i64 {
		self.chain_id
	}

	fn config_hash(&self) -> ConfigHash {
		self.config_hash
	}

	fn signers(&self) -> Vec<NodeId> {
		self.signers.clone()
	}

	fn decode_block_header(&self, raw: &[u8]) -> Result<BlockHeader, DecodeError> {
		decode("block header", raw)
	}

	fn decode_witness(&self, raw: &[u8]) -> Result<BlockWitness, DecodeError> {
		decode("block witness", raw)
	}

	fn block_header_validator(&self) -> BlockHeaderValidator {
		BlockHeaderValidator::new(self.signers.clone(), self.quorum)
	}
}

/// Source of pending configuration changes for managed chains.
#[automock]
pub trait ConfigurationProvider: Send + Sync {
	/// Block at the given height must be built with a new configuration
	fn active_block_needs_configuration_change(&self, height: i64) -> bool;

	/// Configuration with the given hash is pending to be applied at the given height
	fn is_config_pending(&self, height: i64, config_hash: &ConfigHash) -> bool;

	/// Signers of the pending configuration, if such configuration exists
	fn pending_config_signers(&self, height: i64, config_hash: &ConfigHash) -> Option<Vec<NodeId>>;
}

/// Requests the node to restart the blockchain process.
#[automock]
pub trait RestartNotifier: Send + Sync {
	fn notify_restart(&self, with_pending_config: bool);
}

#[cfg(test)]
mod tests {
	use super::*;
	use codec::Encode;
	use crate::test_utils::{base_configuration, header, key_pairs};

	#[test]
	fn decodes_encoded_header() {
		let configuration = base_configuration(&key_pairs(1));
		let header = header(3, None);
		assert_eq!(
			configuration.decode_block_header(&header.encode()),
			Ok(header)
		);
	}

	#[test]
	fn empty_header_is_reported_as_empty() {
		let configuration = base_configuration(&key_pairs(1));
		assert_eq!(
			configuration.decode_block_header(&[]),
			Err(DecodeError::Empty("block header"))
		);
		assert!(matches!(
			configuration.decode_witness(&[1, 2]),
			Err(DecodeError::Invalid { .. })
		));
	}
}

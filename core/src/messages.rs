//! Peer-to-peer messages exchanged by synchronizing nodes.
use crate::{
	error::DecodeError,
	types::{BlockData, BlockRid, ConfigHash, Signature},
};
use codec::{Decode, Encode};
use strum::IntoStaticStr;

/// Block with its witness, as pushed to legacy peers and packed into ranges.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct CompleteBlock {
	pub data: BlockData,
	pub height: i64,
	pub witness: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, IntoStaticStr)]
pub enum Message {
	GetBlockAtHeight {
		height: i64,
	},
	GetBlockRange {
		start_height: i64,
	},
	GetBlockHeaderAndBlock {
		height: i64,
	},
	/// Empty header and witness mean the peer has nothing at or above the requested height
	BlockHeader {
		header: Vec<u8>,
		witness: Vec<u8>,
		requested_height: i64,
	},
	UnfinishedBlock {
		header: Vec<u8>,
		transactions: Vec<Vec<u8>>,
	},
	CompleteBlock(CompleteBlock),
	BlockRange {
		start_height: i64,
		is_full: bool,
		blocks: Vec<CompleteBlock>,
	},
	Status {
		block_rid: Option<BlockRid>,
		height: i64,
		serial: u64,
	},
	AppliedConfig {
		config_hash: ConfigHash,
		height: i64,
	},
	GetBlockSignature {
		block_rid: BlockRid,
	},
	BlockSignature {
		block_rid: BlockRid,
		signature: Signature,
	},
}

impl Message {
	pub fn name(&self) -> &'static str {
		self.into()
	}

	pub fn to_bytes(&self) -> Vec<u8> {
		self.encode()
	}

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
		Message::decode(&mut &bytes[..]).map_err(|error| DecodeError::invalid("message", error))
	}

	/// Returns true for requests answered by the response server.
	pub fn is_request(&self) -> bool {
		matches!(
			self,
			Message::GetBlockAtHeight { .. }
				| Message::GetBlockRange { .. }
				| Message::GetBlockHeaderAndBlock { .. }
				| Message::GetBlockSignature { .. }
		)
	}
}

//! Shared types for block synchronization.
use crate::utils::blake2_256;
use codec::{Decode, Encode};
use derive_more::From;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Milliseconds since the UNIX epoch.
pub type Timestamp = i64;

/// Height of a block which is not present (empty chain).
pub const NO_HEIGHT: i64 = -1;

pub fn millis(duration: Duration) -> i64 {
	i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

macro_rules! hash_type {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(
			Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode, Serialize, Deserialize, From,
		)]
		pub struct $name(pub [u8; 32]);

		impl $name {
			pub fn as_bytes(&self) -> &[u8; 32] {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", hex::encode(&self.0[..4]))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($name), hex::encode(self.0))
			}
		}
	};
}

hash_type!(
	/// Peer identity, the ed25519 public key of the node.
	NodeId
);
hash_type!(
	/// Block identifier, the BLAKE2b-256 hash of the encoded header.
	BlockRid
);
hash_type!(
	/// Hash of the blockchain configuration a block is built with.
	ConfigHash
);

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockHeader {
	pub previous_block_rid: BlockRid,
	pub height: i64,
	pub timestamp: Timestamp,
	/// Configuration the block claims to be built with
	pub config_hash: Option<ConfigHash>,
	/// Configuration which failed to apply before this block
	pub failed_config_hash: Option<ConfigHash>,
	pub merkle_root: [u8; 32],
}

impl BlockHeader {
	pub fn rid(&self) -> BlockRid {
		BlockRid(blake2_256(&self.encode()))
	}

	pub fn merkle_root(transactions: &[Vec<u8>]) -> [u8; 32] {
		blake2_256(&transactions.encode())
	}
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Signature {
	pub subject_id: NodeId,
	pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockWitness {
	pub block_rid: BlockRid,
	pub signatures: Vec<Signature>,
}

/// Encoded header with the block transactions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockData {
	pub header: Vec<u8>,
	pub transactions: Vec<Vec<u8>>,
}

impl BlockData {
	pub fn size(&self) -> usize {
		self.encoded_size()
	}
}

/// Block as stored in the ledger, together with its encoded witness.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockDataWithWitness {
	pub data: BlockData,
	pub witness: Vec<u8>,
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(level.as_str())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_millis_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(value))
	}
}

//! Sequential builder of signed blocks, used to produce chains for peers to serve.
use crate::{
	types::{BlockData, BlockDataWithWitness, BlockHeader, BlockRid, BlockWitness, ConfigHash, NodeId},
	witness::sign,
};
use codec::Encode;
use ed25519_compact::{KeyPair, Seed};
use rand::RngCore;

/// Generates `count` random signer keys.
pub fn generate_key_pairs(count: usize) -> Vec<KeyPair> {
	(0..count)
		.map(|_| {
			let mut seed = [0u8; Seed::BYTES];
			rand::thread_rng().fill_bytes(&mut seed);
			KeyPair::from_seed(Seed::new(seed))
		})
		.collect()
}

pub fn node_id(key_pair: &KeyPair) -> NodeId {
	NodeId(*key_pair.pk)
}

#[derive(Clone)]
pub struct ChainBuilder {
	keys: Vec<KeyPair>,
	signers: usize,
	config_hash: Option<ConfigHash>,
	timestamp_offset: i64,
	transactions_per_block: usize,
	transaction_size: usize,
	blocks: Vec<(BlockHeader, BlockDataWithWitness)>,
}

impl ChainBuilder {
	pub fn new(keys: Vec<KeyPair>) -> Self {
		let signers = keys.len();
		ChainBuilder {
			keys,
			signers,
			config_hash: None,
			timestamp_offset: 0,
			transactions_per_block: 1,
			transaction_size: 32,
			blocks: vec![],
		}
	}

	/// Number of keys signing each block, taken from the start of the key list
	pub fn with_signers(mut self, signers: usize) -> Self {
		self.signers = signers.min(self.keys.len());
		self
	}

	pub fn with_config_hash(mut self, config_hash: Option<ConfigHash>) -> Self {
		self.config_hash = config_hash;
		self
	}

	pub fn with_timestamp_offset(mut self, offset: i64) -> Self {
		self.timestamp_offset = offset;
		self
	}

	pub fn with_transactions(mut self, per_block: usize, size: usize) -> Self {
		self.transactions_per_block = per_block;
		self.transaction_size = size;
		self
	}

	pub fn keys(&self) -> &[KeyPair] {
		&self.keys
	}

	pub fn node_ids(&self) -> Vec<NodeId> {
		self.keys.iter().map(node_id).collect()
	}

	pub fn height(&self) -> i64 {
		self.blocks.len() as i64 - 1
	}

	pub fn header(&self, height: i64) -> BlockHeader {
		self.blocks[height as usize].0.clone()
	}

	pub fn block(&self, height: i64) -> BlockDataWithWitness {
		self.blocks[height as usize].1.clone()
	}

	/// Builds the block on top of the current tip.
	pub fn next_block(&mut self) -> BlockDataWithWitness {
		let height = self.blocks.len() as i64;
		let previous_block_rid = self
			.blocks
			.last()
			.map_or(BlockRid::default(), |(header, _)| header.rid());
		let transactions = (0..self.transactions_per_block)
			.map(|index| {
				let mut transaction = vec![0u8; self.transaction_size];
				rand::thread_rng().fill_bytes(&mut transaction);
				transaction.extend((index as u32).to_le_bytes());
				transaction
			})
			.collect::<Vec<_>>();
		let header = BlockHeader {
			previous_block_rid,
			height,
			timestamp: self.timestamp_offset + height * 1000,
			config_hash: self.config_hash,
			failed_config_hash: None,
			merkle_root: BlockHeader::merkle_root(&transactions),
		};
		let block = BlockDataWithWitness {
			data: BlockData {
				header: header.encode(),
				transactions,
			},
			witness: self.witness(&header, self.signers).encode(),
		};
		self.blocks.push((header, block.clone()));
		block
	}

	pub fn witness(&self, header: &BlockHeader, signers: usize) -> BlockWitness {
		let block_rid = header.rid();
		BlockWitness {
			block_rid,
			signatures: self.keys[..signers]
				.iter()
				.map(|key_pair| sign(key_pair, &block_rid))
				.collect(),
		}
	}

	pub fn blocks(mut self, count: usize) -> Vec<BlockDataWithWitness> {
		(0..count).map(|_| self.next_block()).collect()
	}

	pub fn block_at(mut self, height: i64) -> BlockDataWithWitness {
		while self.height() < height {
			self.next_block();
		}
		self.block(height)
	}
}

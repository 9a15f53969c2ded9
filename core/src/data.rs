//! Ledger access used by the synchronizers.
use crate::{
	configuration::BlockchainConfiguration,
	error::CommitError,
	types::{BlockDataWithWitness, BlockHeader, BlockRid, NodeId, Signature, NO_HEIGHT},
};
use async_trait::async_trait;
use codec::{Decode, Encode};
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::{
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex, PoisonError,
	},
	time::Duration,
};
use tracing::{debug, info};

mod keys;
use keys::*;

mod mem_db;
pub use mem_db::*;

/// Column family for blocks
pub const BLOCKS_CF: &str = "blocks_cf";

/// Column family for ledger metadata
pub const LEDGER_STATE_CF: &str = "ledger_state_cf";

/// Type of the database key which we can get from the custom key.
pub trait RecordKey {
	type Type: Serialize + for<'a> Deserialize<'a> + Encode + Decode;

	fn space(&self) -> Option<&'static str>;

	/// Returns key space (if any) and key
	fn key(&self) -> String;
}

pub trait Database {
	/// Puts value for given key into database.
	fn put<T: RecordKey>(&self, key: T, value: T::Type);

	/// Gets value for given key.
	fn get<T: RecordKey>(&self, key: T) -> Option<T::Type>;

	/// Deletes value from the database for the given key.
	fn delete<T: RecordKey>(&self, key: T);
}

pub struct BlockKey(pub i64);

impl RecordKey for BlockKey {
	type Type = BlockDataWithWitness;

	fn space(&self) -> Option<&'static str> {
		Some(BLOCKS_CF)
	}

	fn key(&self) -> String {
		let BlockKey(height) = self;
		format!("{BLOCK_KEY_PREFIX}:{height}")
	}
}

pub struct BlockHeightKey(pub BlockRid);

impl RecordKey for BlockHeightKey {
	type Type = i64;

	fn space(&self) -> Option<&'static str> {
		Some(BLOCKS_CF)
	}

	fn key(&self) -> String {
		let BlockHeightKey(rid) = self;
		format!("{BLOCK_HEIGHT_KEY_PREFIX}:{}", hex::encode(rid.as_bytes()))
	}
}

pub struct LastBlockKey;

impl RecordKey for LastBlockKey {
	type Type = (i64, BlockRid);

	fn space(&self) -> Option<&'static str> {
		Some(LEDGER_STATE_CF)
	}

	fn key(&self) -> String {
		LAST_BLOCK_KEY.into()
	}
}

/// Read only access to the ledger.
#[automock]
pub trait BlockQueries: Send + Sync {
	/// Height of the last committed block, -1 if the ledger is empty
	fn last_block_height(&self) -> i64;

	fn block_at_height(&self, height: i64) -> Option<BlockDataWithWitness>;

	/// Signature of the local node on the given block
	fn block_signature(&self, block_rid: &BlockRid) -> Option<Signature>;
}

/// Asynchronous block commit.
#[async_trait]
#[automock]
pub trait BlockDatabase: Send + Sync {
	async fn add_block(&self, block: BlockDataWithWitness) -> Result<(), CommitError>;
}

/// Ledger over a key value database, verifying chain continuity on commit.
pub struct LedgerStore<T: Database> {
	db: T,
	node_id: NodeId,
	configuration: Arc<dyn BlockchainConfiguration>,
	commit_delay: Duration,
	closed: AtomicBool,
	pending_aborts: AtomicUsize,
	write_lock: Mutex<()>,
}

impl<T: Database + Send + Sync> LedgerStore<T> {
	pub fn new(db: T, node_id: NodeId, configuration: Arc<dyn BlockchainConfiguration>) -> Self {
		LedgerStore {
			db,
			node_id,
			configuration,
			commit_delay: Duration::ZERO,
			closed: AtomicBool::new(false),
			pending_aborts: AtomicUsize::new(0),
			write_lock: Mutex::new(()),
		}
	}

	/// Simulated storage latency of each commit
	pub fn with_commit_delay(mut self, commit_delay: Duration) -> Self {
		self.commit_delay = commit_delay;
		self
	}

	/// Closes the engine, subsequent commits fail.
	pub fn close(&self) {
		self.closed.store(true, Ordering::SeqCst);
	}

	/// Makes the next `count` commits fail with a storage abort.
	pub fn inject_storage_aborts(&self, count: usize) {
		self.pending_aborts.store(count, Ordering::SeqCst);
	}

	pub fn last_block(&self) -> Option<(i64, BlockRid)> {
		self.db.get(LastBlockKey)
	}

	pub fn block_height(&self, block_rid: &BlockRid) -> Option<i64> {
		self.db.get(BlockHeightKey(*block_rid))
	}

	fn verify(&self, block: &BlockDataWithWitness) -> Result<BlockHeader, CommitError> {
		let configuration = &self.configuration;
		let header = configuration
			.decode_block_header(&block.data.header)
			.map_err(|error| CommitError::BadData(error.to_string()))?;

		let (last_height, last_rid) = self.last_block().unwrap_or((NO_HEIGHT, BlockRid::default()));
		if header.height <= last_height {
			return Err(CommitError::Other(format!(
				"Block at height {} already exists",
				header.height
			)));
		}
		if header.height != last_height + 1 {
			return Err(CommitError::BadData(format!(
				"Expected block at height {}, received {}",
				last_height + 1,
				header.height
			)));
		}
		if header
			.config_hash
			.is_some_and(|hash| hash != configuration.config_hash())
		{
			return Err(CommitError::ConfigurationMismatch);
		}
		if header.failed_config_hash.is_some() {
			return Err(CommitError::FailedConfigurationMismatch);
		}
		if header.merkle_root != BlockHeader::merkle_root(&block.data.transactions) {
			return Err(CommitError::BadData("Invalid merkle root".to_string()));
		}

		let witness = configuration
			.decode_witness(&block.witness)
			.map_err(|error| CommitError::BadData(error.to_string()))?;
		configuration
			.block_header_validator()
			.validate_witness(&header, &witness)
			.map_err(|error| CommitError::BadData(error.to_string()))?;

		// only a witnessed block can prove a fork
		if header.previous_block_rid != last_rid {
			return Err(CommitError::PrevBlockMismatch {
				expected: last_rid,
				received: header.previous_block_rid,
			});
		}
		Ok(header)
	}
}

impl<T: Database + Send + Sync> BlockQueries for LedgerStore<T> {
	fn last_block_height(&self) -> i64 {
		self.last_block().map_or(NO_HEIGHT, |(height, _)| height)
	}

	fn block_at_height(&self, height: i64) -> Option<BlockDataWithWitness> {
		self.db.get(BlockKey(height))
	}

	fn block_signature(&self, block_rid: &BlockRid) -> Option<Signature> {
		let height = self.block_height(block_rid)?;
		let block = self.block_at_height(height)?;
		let witness = self.configuration.decode_witness(&block.witness).ok()?;
		witness
			.signatures
			.into_iter()
			.find(|signature| signature.subject_id == self.node_id)
	}
}

#[async_trait]
impl<T: Database + Send + Sync> BlockDatabase for LedgerStore<T> {
	async fn add_block(&self, block: BlockDataWithWitness) -> Result<(), CommitError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(CommitError::EngineClosed);
		}
		if !self.commit_delay.is_zero() {
			tokio::time::sleep(self.commit_delay).await;
		}

		let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
		if self
			.pending_aborts
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
			.is_ok()
		{
			debug!("Aborting injected storage failure");
			return Err(CommitError::StorageAbort("Transaction aborted".to_string()));
		}

		let header = self.verify(&block)?;
		let rid = header.rid();
		self.db.put(BlockKey(header.height), block);
		self.db.put(BlockHeightKey(rid), header.height);
		self.db.put(LastBlockKey, (header.height, rid));
		info!(height = header.height, block_rid = %rid, "Block committed");
		Ok(())
	}
}

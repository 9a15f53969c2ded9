use crate::{
	chain::generate_key_pairs,
	configuration::{
		BaseBlockchainConfiguration, ConfigurationProvider, MockRestartNotifier, RestartNotifier,
	},
	data::{BlockDatabase, BlockQueries, LedgerStore, MemoryDB},
	network::{CommunicationManager, MockCommunicationManager},
	shutdown::Controller,
	sync::{configuration::SyncParameters, BaseSynchronizer, WorkerContext},
	types::{BlockHeader, BlockRid, BlockWitness, ConfigHash, NodeId, Timestamp},
	utils::Clock,
	witness::{sign, Quorum},
};
use ed25519_compact::KeyPair;
use std::sync::{
	atomic::{AtomicI64, Ordering},
	Arc,
};

pub use crate::chain::ChainBuilder;

pub const CONFIG_HASH: ConfigHash = ConfigHash([1; 32]);
pub const REPLICA: NodeId = NodeId([0xaa; 32]);

pub fn key_pairs(count: usize) -> Vec<KeyPair> {
	generate_key_pairs(count)
}

pub fn node_ids(keys: &[KeyPair]) -> Vec<NodeId> {
	keys.iter().map(crate::chain::node_id).collect()
}

pub fn header(height: i64, config_hash: Option<ConfigHash>) -> BlockHeader {
	BlockHeader {
		previous_block_rid: BlockRid::default(),
		height,
		timestamp: height * 1000,
		config_hash,
		failed_config_hash: None,
		merkle_root: BlockHeader::merkle_root(&[]),
	}
}

pub fn witness(header: &BlockHeader, keys: &[KeyPair]) -> BlockWitness {
	let block_rid = header.rid();
	BlockWitness {
		block_rid,
		signatures: keys.iter().map(|key| sign(key, &block_rid)).collect(),
	}
}

pub fn base_configuration(keys: &[KeyPair]) -> BaseBlockchainConfiguration {
	BaseBlockchainConfiguration {
		chain_id: 1,
		config_hash: CONFIG_HASH,
		signers: node_ids(keys),
		quorum: Quorum::Bft,
	}
}

#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
	pub fn set(&self, now: Timestamp) {
		self.0.store(now, Ordering::SeqCst);
	}

	pub fn advance(&self, millis: i64) {
		self.0.fetch_add(millis, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Timestamp {
		self.0.load(Ordering::SeqCst)
	}
}

/// Worker collaborators backed by a memory ledger and mocks without expectations.
pub struct TestContext {
	keys: Vec<KeyPair>,
	chain_id: i64,
	parameters: SyncParameters,
	clock: ManualClock,
	store: Arc<LedgerStore<MemoryDB>>,
	communication: Arc<dyn CommunicationManager>,
	block_queries: Arc<dyn BlockQueries>,
	block_database: Arc<dyn BlockDatabase>,
	config_provider: Option<Arc<dyn ConfigurationProvider>>,
	restart_notifier: Arc<dyn RestartNotifier>,
	shutdown: Controller<String>,
}

impl TestContext {
	pub fn new(signers: usize) -> Self {
		let keys = key_pairs(signers);
		let configuration = Arc::new(base_configuration(&keys));
		let store = Arc::new(LedgerStore::new(MemoryDB::default(), REPLICA, configuration));
		TestContext {
			keys,
			chain_id: 1,
			parameters: SyncParameters::default(),
			clock: ManualClock::default(),
			block_queries: store.clone(),
			block_database: store.clone(),
			store,
			communication: Arc::new(MockCommunicationManager::new()),
			config_provider: None,
			restart_notifier: Arc::new(MockRestartNotifier::new()),
			shutdown: Controller::new(),
		}
	}

	pub fn keys(&self) -> &[KeyPair] {
		&self.keys
	}

	pub fn signers(&self) -> Vec<NodeId> {
		node_ids(&self.keys)
	}

	pub fn peer(&self, index: usize) -> NodeId {
		self.signers()[index]
	}

	pub fn chain(&self) -> ChainBuilder {
		ChainBuilder::new(self.keys.clone())
	}

	pub fn clock(&self) -> &ManualClock {
		&self.clock
	}

	pub fn store(&self) -> Arc<LedgerStore<MemoryDB>> {
		self.store.clone()
	}

	pub fn shutdown(&self) -> Controller<String> {
		self.shutdown.clone()
	}

	pub fn with_chain_id(mut self, chain_id: i64) -> Self {
		self.chain_id = chain_id;
		self
	}

	pub fn with_parameters(mut self, parameters: SyncParameters) -> Self {
		self.parameters = parameters;
		self
	}

	pub fn with_communication(mut self, communication: impl CommunicationManager + 'static) -> Self {
		self.communication = Arc::new(communication);
		self
	}

	pub fn with_block_queries(mut self, block_queries: impl BlockQueries + 'static) -> Self {
		self.block_queries = Arc::new(block_queries);
		self
	}

	pub fn with_block_database(mut self, block_database: impl BlockDatabase + 'static) -> Self {
		self.block_database = Arc::new(block_database);
		self
	}

	pub fn with_config_provider(mut self, provider: impl ConfigurationProvider + 'static) -> Self {
		self.config_provider = Some(Arc::new(provider));
		self
	}

	pub fn with_restart_notifier(mut self, notifier: impl RestartNotifier + 'static) -> Self {
		self.restart_notifier = Arc::new(notifier);
		self
	}

	pub fn worker_context(&self) -> WorkerContext {
		WorkerContext {
			process_name: "test".to_string(),
			node_id: REPLICA,
			configuration: Arc::new(BaseBlockchainConfiguration {
				chain_id: self.chain_id,
				..base_configuration(&self.keys)
			}),
			config_provider: self.config_provider.clone(),
			communication: self.communication.clone(),
			block_queries: self.block_queries.clone(),
			block_database: self.block_database.clone(),
			restart_notifier: self.restart_notifier.clone(),
			clock: Arc::new(self.clock.clone()),
		}
	}

	pub fn base(&self) -> BaseSynchronizer {
		BaseSynchronizer::new(
			self.worker_context(),
			self.parameters.clone(),
			self.shutdown.clone(),
		)
	}
}

//! In-process network of serving peers and a syncing replica.
use crate::config::RuntimeConfig;
use color_eyre::{eyre::eyre, Result};
use ebft_sync_core::{
	chain::{generate_key_pairs, node_id, ChainBuilder},
	configuration::{BaseBlockchainConfiguration, RestartNotifier},
	data::{BlockDatabase, BlockQueries, LedgerStore, MemoryDB},
	network::memory::MemoryNetwork,
	shutdown::Controller,
	sync::{self, messaging::ResponseServer, WorkerContext},
	types::{ConfigHash, NodeId},
	utils::{spawn_in_span, SystemClock},
	witness::Quorum,
};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

pub const FINAL_HEIGHT_REACHED: &str = "Replica reached the final height";

const CONFIG_HASH: ConfigHash = ConfigHash([1; 32]);

type Store = Arc<LedgerStore<MemoryDB>>;

/// Shuts the simulation down when the replica asks for a restart.
struct ShutdownOnRestart {
	shutdown: Controller<String>,
}

impl RestartNotifier for ShutdownOnRestart {
	fn notify_restart(&self, with_pending_config: bool) {
		warn!(with_pending_config, "Replica requested a blockchain restart");
		let _ = self
			.shutdown
			.trigger_shutdown("Blockchain restart requested".to_string());
	}
}

fn configuration(
	cfg: &RuntimeConfig,
	signers: Vec<NodeId>,
	quorum: Quorum,
) -> Arc<BaseBlockchainConfiguration> {
	Arc::new(BaseBlockchainConfiguration {
		chain_id: cfg.chain_id,
		config_hash: CONFIG_HASH,
		signers,
		quorum,
	})
}

/// Starts a peer answering block requests from its own store.
fn serve(
	cfg: &RuntimeConfig,
	network: &MemoryNetwork,
	peer: NodeId,
	peers: Vec<NodeId>,
	store: Store,
	shutdown: &Controller<String>,
) {
	let communication = Arc::new(network.connect(peer, peers));
	let server = ResponseServer::new(communication.clone(), store);
	spawn_in_span(sync::messaging::serve(
		server,
		communication,
		cfg.serve_poll_interval,
		cfg.status_interval,
		shutdown.clone(),
	));
}

/// Builds the network, starts block production and runs the replica until shutdown.
pub async fn run(cfg: RuntimeConfig, shutdown: Controller<String>) -> Result<()> {
	if cfg.signers == 0 {
		return Err(eyre!("At least one signer is required"));
	}
	let keys = generate_key_pairs(cfg.signers);
	let signers: Vec<NodeId> = keys.iter().map(node_id).collect();
	let byzantine_keys = generate_key_pairs(cfg.byzantine_peers);
	let byzantine: Vec<NodeId> = byzantine_keys.iter().map(node_id).collect();
	let replica = node_id(&generate_key_pairs(1)[0]);

	let all_peers: Vec<NodeId> = signers
		.iter()
		.chain(&byzantine)
		.copied()
		.chain([replica])
		.collect();
	let network = MemoryNetwork::default();
	let honest_configuration = configuration(&cfg, signers.clone(), cfg.sync.quorum);

	let mut chain = ChainBuilder::new(keys)
		.with_config_hash(Some(CONFIG_HASH))
		.with_transactions(cfg.transactions_per_block, cfg.transaction_size);
	let honest_stores: Vec<Store> = signers
		.iter()
		.map(|signer| {
			Arc::new(LedgerStore::new(
				MemoryDB::default(),
				*signer,
				honest_configuration.clone(),
			))
		})
		.collect();
	for _ in 0..cfg.initial_blocks.min(cfg.blocks) {
		let block = chain.next_block();
		for store in &honest_stores {
			store.add_block(block.clone()).await?;
		}
	}
	for (signer, store) in signers.iter().zip(&honest_stores) {
		serve(&cfg, &network, *signer, all_peers.clone(), store.clone(), &shutdown);
	}
	info!(
		signers = signers.len(),
		height = chain.height(),
		"Honest peers are serving"
	);

	// a byzantine peer signs its own chain, which the replica must reject
	for (peer, key) in byzantine.iter().zip(byzantine_keys) {
		let forged_configuration = configuration(&cfg, vec![*peer], Quorum::Fixed(1));
		let store = Arc::new(LedgerStore::new(MemoryDB::default(), *peer, forged_configuration));
		let mut forged = ChainBuilder::new(vec![key]).with_config_hash(Some(CONFIG_HASH));
		for _ in 0..cfg.blocks {
			store.add_block(forged.next_block()).await?;
		}
		serve(&cfg, &network, *peer, all_peers.clone(), store, &shutdown);
	}
	if !byzantine.is_empty() {
		info!(peers = byzantine.len(), "Byzantine peers are serving");
	}

	let produce = {
		let cfg = cfg.clone();
		async move {
			let mut ticks = interval(cfg.block_interval);
			ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
			while chain.height() < cfg.final_height() {
				ticks.tick().await;
				let block = chain.next_block();
				for store in &honest_stores {
					if let Err(error) = store.add_block(block.clone()).await {
						error!(%error, "Block production failed");
						return;
					}
				}
			}
			info!(height = chain.height(), "Block production finished");
		}
	};
	spawn_in_span(shutdown.with_cancel(produce));

	let replica_store = Arc::new(
		LedgerStore::new(MemoryDB::default(), replica, honest_configuration.clone())
			.with_commit_delay(cfg.commit_delay),
	);
	let context = WorkerContext {
		process_name: format!("replica-{replica}"),
		node_id: replica,
		configuration: honest_configuration,
		config_provider: None,
		communication: Arc::new(network.connect(replica, all_peers)),
		block_queries: replica_store.clone(),
		block_database: replica_store.clone(),
		restart_notifier: Arc::new(ShutdownOnRestart {
			shutdown: shutdown.clone(),
		}),
		clock: Arc::new(SystemClock),
	};

	let final_height = cfg.final_height();
	let poll_interval = cfg.serve_poll_interval;
	let watch = {
		let shutdown = shutdown.clone();
		let store = replica_store.clone();
		async move {
			let mut ticks = interval(poll_interval);
			while store.last_block_height() < final_height {
				ticks.tick().await;
			}
			info!(height = final_height, "Replica is in sync");
			let _ = shutdown.trigger_shutdown(FINAL_HEIGHT_REACHED.to_string());
		}
	};
	spawn_in_span(shutdown.with_cancel(watch));

	let replicate = {
		let shutdown = shutdown.clone();
		async move {
			match sync::run(context, cfg.sync, shutdown.clone()).await {
				Ok(height) => info!(height, "Replica stopped"),
				Err(error) => {
					error!("{error:#}");
					let _ = shutdown.trigger_shutdown(format!("Replica failed: {error:#}"));
				},
			}
		}
	};
	spawn_in_span(shutdown.with_delay(replicate)?);
	Ok(())
}

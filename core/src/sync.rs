//! Block synchronization of a replica with its peers.
//!
//! A replica first catches up with [`fast::FastSynchronizer`], asking many peers for
//! single heights in parallel. Once every responsive peer is drained it follows the tip
//! with [`slow::SlowSynchronizer`], which keeps a single block range request in flight.
use crate::{
	configuration::{BlockchainConfiguration, ConfigurationProvider, RestartNotifier},
	data::{BlockDatabase, BlockQueries},
	error::CommitError,
	network::CommunicationManager,
	shutdown::Controller,
	types::{BlockDataWithWitness, BlockHeader, ConfigHash, NodeId, Timestamp, NO_HEIGHT},
	utils::{spawn_in_span, Clock},
	witness::BlockHeaderValidator,
};
use color_eyre::{eyre::WrapErr, Result};
use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

pub mod block_packer;
pub mod configuration;
pub mod fast;
pub mod messaging;
pub mod peers;
pub mod slow;

use configuration::SyncParameters;
use messaging::ResponseServer;
use peers::PeerStatuses;

/// Collaborators of a blockchain worker.
#[derive(Clone)]
pub struct WorkerContext {
	pub process_name: String,
	pub node_id: NodeId,
	pub configuration: Arc<dyn BlockchainConfiguration>,
	/// Present for chains with managed configuration
	pub config_provider: Option<Arc<dyn ConfigurationProvider>>,
	pub communication: Arc<dyn CommunicationManager>,
	pub block_queries: Arc<dyn BlockQueries>,
	pub block_database: Arc<dyn BlockDatabase>,
	pub restart_notifier: Arc<dyn RestartNotifier>,
	pub clock: Arc<dyn Clock>,
}

/// Result of a single block commit, reported back to the synchronizer loop.
#[derive(Debug)]
pub struct CommitOutcome {
	pub height: i64,
	pub peer: NodeId,
	pub header: BlockHeader,
	pub witness: Vec<u8>,
	pub result: Result<(), CommitError>,
}

/// State and policies shared by the fast and slow synchronizers.
pub struct BaseSynchronizer {
	pub(crate) context: WorkerContext,
	pub(crate) parameters: SyncParameters,
	pub(crate) peers: PeerStatuses,
	pub(crate) response_server: ResponseServer,
	pub(crate) shutdown: Controller<String>,
	/// Height of the last block committed through this synchronizer
	pub(crate) block_height: i64,
	applied_config_senders: HashMap<ConfigHash, HashSet<NodeId>>,
	restart_requested: bool,
	commit_sender: UnboundedSender<CommitOutcome>,
	pub(crate) commit_receiver: UnboundedReceiver<CommitOutcome>,
}

impl BaseSynchronizer {
	pub fn new(
		context: WorkerContext,
		parameters: SyncParameters,
		shutdown: Controller<String>,
	) -> Self {
		let (commit_sender, commit_receiver) = unbounded_channel();
		let response_server = ResponseServer::new(
			context.communication.clone(),
			context.block_queries.clone(),
		);
		let block_height = context.block_queries.last_block_height();
		BaseSynchronizer {
			peers: PeerStatuses::new(parameters.clone()),
			context,
			parameters,
			response_server,
			shutdown,
			block_height,
			applied_config_senders: HashMap::new(),
			restart_requested: false,
			commit_sender,
			commit_receiver,
		}
	}

	pub fn block_height(&self) -> i64 {
		self.block_height
	}

	pub fn peers(&self) -> &PeerStatuses {
		&self.peers
	}

	pub(crate) fn now(&self) -> Timestamp {
		self.context.clock.now()
	}

	pub fn restart_requested(&self) -> bool {
		self.restart_requested
	}

	/// New requests are dispatched only while this holds.
	pub(crate) fn is_running(&self) -> bool {
		!self.restart_requested && !self.shutdown.is_shutdown_triggered()
	}

	pub(crate) fn blacklist(&mut self, peer: NodeId, reason: &str) {
		let now = self.now();
		self.peers.maybe_blacklist(peer, reason, now);
	}

	fn validator(&self) -> BlockHeaderValidator {
		self.context.configuration.block_header_validator()
	}

	/// Validates the witness against the signers of the active configuration.
	pub(crate) fn check_witness(&self, header: &BlockHeader, raw_witness: &[u8]) -> Result<(), String> {
		let witness = self
			.context
			.configuration
			.decode_witness(raw_witness)
			.map_err(|error| error.to_string())?;
		self.validator()
			.validate_witness(header, &witness)
			.map_err(|error| error.to_string())
	}

	/// Like [`Self::check_witness`], but headers of another configuration pass.
	/// Their witness is checked on commit, before the block is linked to the chain.
	pub(crate) fn check_active_config_witness(
		&self,
		header: &BlockHeader,
		raw_witness: &[u8],
	) -> Result<(), String> {
		if header
			.config_hash
			.is_some_and(|hash| hash != self.context.configuration.config_hash())
		{
			return Ok(());
		}
		self.check_witness(header, raw_witness)
	}

	/// Status gossip carries the height the peer is building, it has the block below.
	pub(crate) fn status_received(&mut self, peer: NodeId, height: i64) {
		match height.checked_sub(1) {
			Some(last_height) if last_height >= NO_HEIGHT => {
				self.peers.status_received(peer, last_height)
			},
			_ => self.blacklist(peer, &format!("Invalid status height {height}")),
		}
	}

	/// Commits blocks one by one on a separate task, stopping at the first failure.
	/// The task delays the shutdown completion until the started writes are done.
	pub(crate) fn spawn_commit(
		&self,
		peer: NodeId,
		blocks: Vec<(BlockHeader, BlockDataWithWitness)>,
	) -> bool {
		let database = self.context.block_database.clone();
		let sender = self.commit_sender.clone();
		let commit = async move {
			for (header, block) in blocks {
				let witness = block.witness.clone();
				let result = database.add_block(block).await;
				let failed = result.is_err();
				let outcome = CommitOutcome {
					height: header.height,
					peer,
					header,
					witness,
					result,
				};
				if sender.send(outcome).is_err() || failed {
					break;
				}
			}
		};
		match self.shutdown.with_delay(commit) {
			Ok(commit) => {
				spawn_in_span(commit);
				true
			},
			Err(error) => {
				debug!(%error, "Commit not started");
				false
			},
		}
	}

	fn request_restart(&mut self, with_pending_config: bool) {
		info!(
			process = self.context.process_name,
			with_pending_config, "Requesting blockchain restart"
		);
		self.restart_requested = true;
		self.context
			.restart_notifier
			.notify_restart(with_pending_config);
	}

	/// Applies the failed commit policy of each error kind.
	/// Fatal errors are only logged here, callers propagate them.
	pub(crate) fn handle_add_block_error(
		&mut self,
		peer: NodeId,
		header: &BlockHeader,
		raw_witness: &[u8],
		error: &CommitError,
	) {
		let height = header.height;
		match error {
			CommitError::EngineClosed | CommitError::StorageAbort(_) => {
				debug!(%error, height, "Commit failed");
			},
			CommitError::PrevBlockMismatch { .. } => {
				error!(%error, height, %peer, event_type = "CHAIN_DIVERGED", "Local and remote chains diverged");
			},
			CommitError::ConfigurationMismatch => {
				let needs_change = self
					.context
					.config_provider
					.as_ref()
					.is_some_and(|provider| provider.active_block_needs_configuration_change(height));
				if needs_change {
					self.request_restart(false);
				} else if !header
					.config_hash
					.is_some_and(|hash| self.try_pending_config(header, raw_witness, hash))
				{
					self.blacklist(
						peer,
						"Received a block with mismatching config but we could not apply any new config",
					);
				}
			},
			CommitError::FailedConfigurationMismatch => {
				if !header
					.failed_config_hash
					.is_some_and(|hash| self.try_pending_config(header, raw_witness, hash))
				{
					self.blacklist(
						peer,
						"Received a block with a failed config we could not apply",
					);
				}
			},
			CommitError::BadData(_) => {
				warn!(%error, height, %peer, "Received invalid block");
				self.blacklist(peer, &format!("Invalid block {height}. Blacklisting peer {peer}: {error}"));
			},
			CommitError::Other(_) => {
				error!(%error, height, %peer, "Failed to commit block");
				self.blacklist(peer, &format!("Invalid block {height}. Blacklisting peer {peer}: {error}"));
			},
		}
	}

	/// Restarts with the pending configuration if its signers witnessed the block.
	fn try_pending_config(
		&mut self,
		header: &BlockHeader,
		raw_witness: &[u8],
		config_hash: ConfigHash,
	) -> bool {
		if self.context.configuration.chain_id() == 0 {
			return false;
		}
		let Some(provider) = self.context.config_provider.clone() else {
			return false;
		};
		if !provider.is_config_pending(header.height, &config_hash) {
			return false;
		}
		let Some(signers) = provider.pending_config_signers(header.height, &config_hash) else {
			return false;
		};
		let Ok(witness) = self.context.configuration.decode_witness(raw_witness) else {
			return false;
		};
		let validator = BlockHeaderValidator::new(signers, self.parameters.quorum);
		if let Err(error) = validator.validate_witness(header, &witness) {
			debug!(%error, height = header.height, "Block is not witnessed by pending config signers");
			return false;
		}
		self.request_restart(true);
		true
	}

	/// Tracks peers which applied a pending configuration at the next height and
	/// restarts once enough signers did so. Returns true if a restart was requested.
	pub(crate) fn check_if_we_need_to_apply_pending_config(
		&mut self,
		peer: NodeId,
		config_hash: ConfigHash,
		height: i64,
	) -> bool {
		let configuration = self.context.configuration.clone();
		if configuration.chain_id() == 0 {
			return false;
		}
		let Some(provider) = self.context.config_provider.clone() else {
			return false;
		};
		if self.context.block_queries.last_block_height() + 1 != height
			|| config_hash == configuration.config_hash()
			|| !provider.is_config_pending(height, &config_hash)
		{
			return false;
		}
		let Some(pending_signers) = provider.pending_config_signers(height, &config_hash) else {
			return false;
		};

		let applied = self.applied_config_senders.entry(config_hash).or_default();
		applied.insert(peer);

		let current_signers = configuration.signers();
		let relevant_signers_that_have_applied_config = pending_signers
			.iter()
			.filter(|signer| current_signers.contains(signer) && applied.contains(signer))
			.count();
		let promoted_nodes = pending_signers
			.iter()
			.filter(|signer| !current_signers.contains(signer))
			.count();
		let required = self.parameters.quorum.required(pending_signers.len());
		debug!(
			height,
			applied = relevant_signers_that_have_applied_config,
			promoted = promoted_nodes,
			required,
			"Peer applied pending config"
		);
		if relevant_signers_that_have_applied_config + promoted_nodes >= required {
			self.applied_config_senders.remove(&config_hash);
			self.request_restart(true);
			return true;
		}
		false
	}
}

/// Catches up with fast sync, then follows the tip with slow sync until shutdown.
pub async fn run(
	context: WorkerContext,
	parameters: SyncParameters,
	shutdown: Controller<String>,
) -> Result<i64> {
	let base = BaseSynchronizer::new(context, parameters, shutdown.clone());
	info!(height = base.block_height(), "Starting fast sync");

	let mut fast = fast::FastSynchronizer::new(base);
	fast.sync_until_responsive_peers_drained()
		.await
		.wrap_err("Fast sync stopped")?;
	let base = fast.into_base();
	info!(height = base.block_height(), "Fast sync finished");

	if !base.is_running() {
		return Ok(base.block_height());
	}

	let mut slow = slow::SlowSynchronizer::new(base);
	slow.sync_until_shutdown()
		.await
		.wrap_err("Slow sync stopped")?;
	Ok(slow.into_base().block_height())
}

//! Tip following with a single block range request in flight.
//!
//! Slow sync asks one peer for up to a package of blocks at a time and naps between
//! requests, adapting the nap to the rate blocks are actually produced.
use super::{BaseSynchronizer, CommitOutcome};
use crate::{
	error::CommitError,
	messages::{CompleteBlock, Message},
	types::{millis, BlockDataWithWitness, BlockHeader, NodeId, Timestamp},
};
use std::collections::HashSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

mod sleep_data;
mod state_machine;

pub use sleep_data::SlowSyncSleepData;
pub use state_machine::{SlowSyncState, SlowSyncStateMachine};

pub struct SlowSynchronizer {
	base: BaseSynchronizer,
	state_machine: SlowSyncStateMachine,
}

impl SlowSynchronizer {
	pub fn new(base: BaseSynchronizer) -> Self {
		let state_machine = SlowSyncStateMachine::new(
			base.block_height,
			millis(base.parameters.slow_sync_max_peer_wait_time),
		);
		SlowSynchronizer {
			base,
			state_machine,
		}
	}

	pub fn into_base(self) -> BaseSynchronizer {
		self.base
	}

	pub fn state_machine(&self) -> &SlowSyncStateMachine {
		&self.state_machine
	}

	/// Follows the tip until shutdown or restart. A chain divergence stops the
	/// synchronizer with an error.
	pub async fn sync_until_shutdown(&mut self) -> Result<(), CommitError> {
		let height = self.base.context.block_queries.last_block_height();
		self.base.block_height = height;
		self.state_machine = SlowSyncStateMachine::new(
			height,
			millis(self.base.parameters.slow_sync_max_peer_wait_time),
		);
		for peer in self.base.context.communication.configured_peers() {
			self.base.peers.add_peer(peer);
		}
		debug!(height, "Slow sync started");

		let mut sleep_data = SlowSyncSleepData::new(&self.base.parameters);
		let result = self.sync_loop(&mut sleep_data).await;

		debug!(height = self.base.block_height, "Awaiting commits");
		if let Err(error) = self.wait_for_commits().await {
			warn!(%error, "Commit failed while stopping slow sync");
		}
		self.base.peers.clear();
		debug!(height = self.base.block_height, "Slow sync stopped");
		result
	}

	async fn sync_loop(&mut self, sleep_data: &mut SlowSyncSleepData) -> Result<(), CommitError> {
		let max_nap = self.base.parameters.slow_sync_max_nap;
		while self.base.is_running() {
			self.process_messages(sleep_data).await?;
			self.process_done_commits()?;
			if !self.base.is_running() {
				break;
			}
			let now = self.base.now();
			let base = &mut self.base;
			self.state_machine
				.maybe_get_block_range(now, sleep_data.current_sleep_millis(), |start_height, avoid| {
					send_request(base, start_height, avoid, now)
				});
			sleep(sleep_data.current_sleep().min(max_nap)).await;
		}
		Ok(())
	}

	/// Only block ranges are expected here, requests of other nodes are answered.
	pub(crate) async fn process_messages(
		&mut self,
		sleep_data: &mut SlowSyncSleepData,
	) -> Result<(), CommitError> {
		for (peer, message) in self.base.context.communication.get_packets() {
			let now = self.base.now();
			if self.base.peers.is_blacklisted(&peer, now) {
				trace!(%peer, message = message.name(), "Ignoring message of blacklisted peer");
				continue;
			}
			if matches!(
				message,
				Message::GetBlockHeaderAndBlock { .. } | Message::BlockHeader { .. }
			) {
				self.base.peers.confirm_modern(peer);
			}
			if message.is_request() {
				self.base.response_server.handle_request(peer, message);
				continue;
			}

			match message {
				Message::BlockRange {
					start_height,
					blocks,
					..
				} => {
					let processed = self.handle_block_range(peer, start_height, blocks).await?;
					sleep_data.update_data(self.base.now(), processed);
				},
				Message::Status { height, .. } => self.base.status_received(peer, height),
				Message::AppliedConfig {
					config_hash,
					height,
				} => {
					if self
						.base
						.check_if_we_need_to_apply_pending_config(peer, config_hash, height)
					{
						return Ok(());
					}
				},
				other => trace!(%peer, message = other.name(), "Ignoring message"),
			}
		}
		Ok(())
	}

	fn process_done_commits(&mut self) -> Result<(), CommitError> {
		while let Ok(outcome) = self.base.commit_receiver.try_recv() {
			self.process_commit_outcome(outcome)?;
		}
		Ok(())
	}

	fn process_commit_outcome(&mut self, outcome: CommitOutcome) -> Result<(), CommitError> {
		let CommitOutcome {
			height,
			peer,
			header,
			witness,
			result,
		} = outcome;
		match result {
			Ok(()) => {
				debug!(height, "Slow sync committed block");
				self.state_machine.update_after_successful_commit(height);
				self.base.block_height = height;
			},
			Err(error) => {
				self.base
					.handle_add_block_error(peer, &header, &witness, &error);
				self.state_machine.update_after_failed_commit(height);
				if error.is_fatal() {
					return Err(error);
				}
			},
		}
		Ok(())
	}

	/// Blocks until the commits of the previous range are done.
	/// Returns false if a commit did not complete in time.
	async fn wait_for_commits(&mut self) -> Result<bool, CommitError> {
		let wait = self.base.parameters.slow_sync_commit_wait_timeout;
		while self.state_machine.is_waiting_for_blocks_to_commit() {
			trace!(machine = %self.state_machine, "Waiting for commits");
			match timeout(wait, self.base.commit_receiver.recv()).await {
				Ok(Some(outcome)) => self.process_commit_outcome(outcome)?,
				Ok(None) | Err(_) => return Ok(false),
			}
		}
		Ok(true)
	}

	/// Validates and commits a block range answer. Returns the number of accepted blocks.
	pub(crate) async fn handle_block_range(
		&mut self,
		peer: NodeId,
		start_height: i64,
		blocks: Vec<CompleteBlock>,
	) -> Result<usize, CommitError> {
		if self.state_machine.state() != SlowSyncState::WaitForReply {
			self.base.blacklist(
				peer,
				&format!(
					"Slow Sync: We are not waiting for a block range. Why does {peer} send us this? {}",
					self.state_machine
				),
			);
			return Ok(0);
		}
		if !self.state_machine.is_height_we_wait_for(start_height) {
			self.base.blacklist(
				peer,
				&format!(
					"Slow Sync: Block range starts at height {start_height}, we expected {}",
					self.state_machine
				),
			);
			return Ok(0);
		}
		if !self.state_machine.is_peer_we_wait_for(&peer) {
			// the request to the expected peer timed out, the answer is still usable
			debug!(%peer, start_height, "Block range from a peer we did not wait for");
		}

		if !self.wait_for_commits().await? {
			info!(start_height, "Commits did not complete in time, dropping block range");
			self.state_machine.reset_to_wait_for_action(self.base.now());
			return Ok(0);
		}
		if self.state_machine.has_unacknowledged_failed_commit() {
			debug!(start_height, "Previous commit failed, dropping block range");
			self.state_machine.acknowledge_failed_commit();
			self.state_machine.reset_to_wait_for_action(self.base.now());
			return Ok(0);
		}

		debug!(%peer, start_height, count = blocks.len(), "Got block range");
		let mut validated = Vec::with_capacity(blocks.len());
		for (height, block) in (start_height..).zip(blocks) {
			let Some(header) = self.handle_block_header(peer, &block, height) else {
				break;
			};
			let CompleteBlock { data, witness, .. } = block;
			validated.push((header, BlockDataWithWitness { data, witness }));
		}

		let processed = validated.len();
		if let Some((last, _)) = validated.last() {
			self.state_machine.update_uncommitted_height(last.height);
			if !self.base.spawn_commit(peer, validated) {
				self.state_machine.update_after_failed_commit(start_height);
			}
		}
		self.state_machine.reset_to_wait_for_action(self.base.now());
		Ok(processed)
	}

	fn handle_block_header(&mut self, peer: NodeId, block: &CompleteBlock, height: i64) -> Option<BlockHeader> {
		let raw_header = &block.data.header;
		if raw_header.is_empty() {
			let reason = if block.witness.is_empty() {
				format!("Slow Sync: Sent empty header at height: {height}")
			} else {
				format!("Slow Sync: Why did we get a witness without a header? Height: {height}")
			};
			self.base.blacklist(peer, &reason);
			return None;
		}
		let header = match self.base.context.configuration.decode_block_header(raw_header) {
			Ok(header) => header,
			Err(error) => {
				self.base
					.blacklist(peer, &format!("Slow Sync: Cannot decode header ({error})"));
				return None;
			},
		};
		if header.height != height {
			self.base.blacklist(
				peer,
				&format!("Slow Sync: Header height={}, we expected height: {height}", header.height),
			);
			return None;
		}
		if let Err(error) = self.base.check_active_config_witness(&header, &block.witness) {
			self.base.blacklist(
				peer,
				&format!("Slow Sync: Invalid header received ({error}). Height: {height}"),
			);
			return None;
		}
		Some(header)
	}
}

/// Asks a random syncable peer for a block range, avoiding the last asked peer when possible.
fn send_request(
	base: &mut BaseSynchronizer,
	start_height: i64,
	avoid: Option<NodeId>,
	now: Timestamp,
) -> Option<NodeId> {
	let configured: HashSet<NodeId> = base
		.context
		.communication
		.configured_peers()
		.into_iter()
		.collect();
	let excluded = base.peers.non_syncable(start_height, now);
	let mut candidates: HashSet<NodeId> = configured.difference(&excluded).copied().collect();
	if candidates.is_empty() {
		warn!(height = start_height - 1, "No peers to request blocks from");
		return None;
	}
	if let Some(avoid) = avoid.filter(|_| candidates.len() > 1) {
		candidates.remove(&avoid);
	}

	let excluded = configured.difference(&candidates).copied().collect();
	let (peer, connected) = base
		.context
		.communication
		.send_to_random_peer(Message::GetBlockRange { start_height }, &excluded);
	let disconnected = configured.difference(&connected).copied().collect();
	base.peers.mark_connected(&connected);
	base.peers.mark_disconnected(&disconnected);
	if peer.is_none() {
		warn!(height = start_height - 1, "No connected peers to request blocks from");
	}
	peer
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		data::{BlockDatabase, BlockQueries, LedgerStore, MemoryDB, MockBlockDatabase},
		network::MockCommunicationManager,
		sync::{
			block_packer::pack_block_range, configuration::SyncParameters,
			messaging::ResponseServer,
		},
		configuration::{MockConfigurationProvider, MockRestartNotifier},
		test_utils::{base_configuration, header, key_pairs, node_ids, witness, TestContext, REPLICA},
		types::{BlockData, BlockRid, ConfigHash},
	};
	use codec::Encode;
	use mockall::predicate::{always, eq};
	use std::{
		sync::{Arc, Mutex},
		time::Duration,
	};

	fn answering(peer: NodeId) -> MockCommunicationManager {
		let mut communication = MockCommunicationManager::new();
		communication
			.expect_configured_peers()
			.returning(move || vec![peer]);
		communication
			.expect_send_to_random_peer()
			.with(always(), always())
			.returning(move |_, excluded| {
				((!excluded.contains(&peer)).then_some(peer), HashSet::from([peer]))
			});
		communication
	}

	fn complete(block: &BlockDataWithWitness, height: i64) -> CompleteBlock {
		CompleteBlock {
			data: block.data.clone(),
			height,
			witness: block.witness.clone(),
		}
	}

	/// Slow synchronizer waiting for a range at `height + 1` from `peer`.
	fn waiting(context: &TestContext, peer: NodeId) -> SlowSynchronizer {
		let mut slow = SlowSynchronizer::new(context.base());
		let now = slow.base.now();
		let base = &mut slow.base;
		slow.state_machine
			.maybe_get_block_range(now + 1, 0, |start_height, avoid| {
				send_request(base, start_height, avoid, now)
			});
		assert_eq!(slow.state_machine.state(), SlowSyncState::WaitForReply);
		assert!(slow.state_machine.is_peer_we_wait_for(&peer));
		slow
	}

	#[tokio::test]
	async fn block_range_is_committed_sequentially() {
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4).with_communication(answering(peer));
		let mut chain = context.chain();
		let blocks: Vec<_> = (0..11).map(|_| chain.next_block()).collect();
		context.store().add_block(blocks[0].clone()).await.unwrap();

		let mut slow = waiting(&context, peer);
		assert!(slow.state_machine.is_height_we_wait_for(1));
		let range = (1..=10).map(|height| complete(&blocks[height as usize], height)).collect();
		assert_eq!(slow.handle_block_range(peer, 1, range).await, Ok(10));
		assert_eq!(slow.state_machine.state(), SlowSyncState::WaitForAction);
		assert_eq!(slow.state_machine.last_uncommitted_height, 10);

		assert!(slow.wait_for_commits().await.unwrap());
		assert_eq!(slow.state_machine.last_committed_height, 10);
		assert_eq!(slow.base.block_height(), 10);
		assert_eq!(context.store().last_block_height(), 10);
		assert_eq!(slow.state_machine.start_height(), 11);
	}

	#[tokio::test]
	async fn range_served_by_response_server_is_accepted() {
		let context = TestContext::new(4);
		let peer = context.peer(1);
		let mut chain = context.chain();
		let serving = Arc::new(LedgerStore::new(
			MemoryDB::default(),
			peer,
			Arc::new(base_configuration(context.keys())),
		));
		for _ in 0..=10 {
			serving.add_block(chain.next_block()).await.unwrap();
		}
		context.store().add_block(chain.block(0)).await.unwrap();

		let sent = Arc::new(Mutex::new(vec![]));
		let recorded = sent.clone();
		let mut requests = MockCommunicationManager::new();
		requests
			.expect_send_packet()
			.returning(move |message, _| recorded.lock().unwrap().push(message));
		let server = ResponseServer::new(Arc::new(requests), serving);
		server.send_block_range_from_height(REPLICA, 1);
		let Some(Message::BlockRange {
			start_height,
			is_full,
			blocks,
		}) = sent.lock().unwrap().pop()
		else {
			panic!("block range expected");
		};
		assert_eq!((start_height, is_full, blocks.len()), (1, false, 10));

		let context = context.with_communication(answering(peer));
		let mut slow = waiting(&context, peer);
		assert!(slow.state_machine.is_height_we_wait_for(1));
		assert_eq!(slow.handle_block_range(peer, start_height, blocks).await, Ok(10));
		assert_eq!(slow.state_machine.state(), SlowSyncState::WaitForAction);
		assert!(slow.wait_for_commits().await.unwrap());
		assert_eq!(context.store().last_block_height(), 10);
	}

	#[tokio::test]
	async fn unexpected_range_blacklists() {
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_parameters(SyncParameters {
				max_errors_before_blacklisting: 1,
				..Default::default()
			});
		let mut slow = SlowSynchronizer::new(context.base());
		assert_eq!(slow.handle_block_range(peer, 0, vec![]).await, Ok(0));
		assert!(slow.base.peers.is_blacklisted(&peer, 0));

		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_parameters(SyncParameters {
				max_errors_before_blacklisting: 1,
				..Default::default()
			});
		let mut slow = waiting(&context, peer);
		assert_eq!(slow.handle_block_range(peer, 5, vec![]).await, Ok(0));
		assert!(slow.base.peers.is_blacklisted(&peer, 0));
		assert_eq!(slow.state_machine.state(), SlowSyncState::WaitForReply);
	}

	#[tokio::test]
	async fn empty_range_returns_to_wait_for_action() {
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4).with_communication(answering(peer));
		let mut slow = waiting(&context, peer);
		assert_eq!(slow.handle_block_range(peer, 0, vec![]).await, Ok(0));
		assert_eq!(slow.state_machine.state(), SlowSyncState::WaitForAction);
		assert!(!slow.base.peers.is_blacklisted(&peer, 0));
	}

	#[tokio::test]
	async fn invalid_block_stops_range() {
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_parameters(SyncParameters {
				max_errors_before_blacklisting: 1,
				..Default::default()
			});
		let mut chain = context.chain();
		let mut blocks: Vec<_> = (0..3).map(|height| complete(&chain.next_block(), height)).collect();
		blocks[2].witness = context.chain().with_signers(1).block_at(2).witness;

		let mut slow = waiting(&context, peer);
		assert_eq!(slow.handle_block_range(peer, 0, blocks).await, Ok(2));
		assert!(slow.base.peers.is_blacklisted(&peer, 0));
		assert!(slow.wait_for_commits().await.unwrap());
		assert_eq!(context.store().last_block_height(), 1);
	}

	#[tokio::test]
	async fn failed_commit_drops_next_range() {
		let mut database = MockBlockDatabase::new();
		database
			.expect_add_block()
			.times(1)
			.returning(|_| Box::pin(async { Err(CommitError::StorageAbort("deadlock".to_string())) }));
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_block_database(database);
		let mut chain = context.chain();
		let blocks: Vec<_> = (0..2).map(|height| complete(&chain.next_block(), height)).collect();

		let mut slow = waiting(&context, peer);
		assert_eq!(slow.handle_block_range(peer, 0, blocks).await, Ok(2));

		// next request is sent before the failure is noticed
		let now = slow.base.now();
		let base = &mut slow.base;
		slow.state_machine
			.maybe_get_block_range(now + 1, 0, |start_height, avoid| {
				send_request(base, start_height, avoid, now)
			});
		assert!(slow.state_machine.is_height_we_wait_for(2));

		assert_eq!(slow.handle_block_range(peer, 2, vec![]).await, Ok(0));
		assert!(!slow.state_machine.has_unacknowledged_failed_commit());
		assert_eq!(slow.state_machine.state(), SlowSyncState::WaitForAction);
		assert_eq!(slow.state_machine.start_height(), 0);
	}

	#[tokio::test]
	async fn chain_divergence_is_fatal() {
		let error = CommitError::PrevBlockMismatch {
			expected: BlockRid([1; 32]),
			received: BlockRid([2; 32]),
		};
		let mut database = MockBlockDatabase::new();
		let returned = error.clone();
		database
			.expect_add_block()
			.returning(move |_| {
				let error = returned.clone();
				Box::pin(async move { Err(error) })
			});
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_block_database(database);
		let mut chain = context.chain();
		let blocks = vec![complete(&chain.next_block(), 0)];

		let mut slow = waiting(&context, peer);
		assert_eq!(slow.handle_block_range(peer, 0, blocks).await, Ok(1));
		assert_eq!(slow.wait_for_commits().await, Err(error));
	}

	/// Header 1 of another configuration, linked to a parent we do not have.
	fn foreign_header(config_hash: ConfigHash) -> BlockHeader {
		BlockHeader {
			previous_block_rid: BlockRid([7; 32]),
			..header(1, Some(config_hash))
		}
	}

	fn foreign_block(header: &BlockHeader, raw_witness: Vec<u8>) -> CompleteBlock {
		CompleteBlock {
			data: BlockData {
				header: header.encode(),
				transactions: vec![],
			},
			height: header.height,
			witness: raw_witness,
		}
	}

	#[tokio::test]
	async fn unwitnessed_foreign_config_block_blacklists() {
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_parameters(SyncParameters {
				max_errors_before_blacklisting: 1,
				..Default::default()
			});
		context.store().add_block(context.chain().next_block()).await.unwrap();

		let mut slow = waiting(&context, peer);
		let blocks = vec![foreign_block(&foreign_header(ConfigHash([9; 32])), vec![])];
		assert_eq!(slow.handle_block_range(peer, 1, blocks).await, Ok(1));
		assert_eq!(slow.wait_for_commits().await, Ok(true));
		assert!(slow.base.peers.is_blacklisted(&peer, 0));
		assert!(!slow.base.restart_requested());
		assert_eq!(context.store().last_block_height(), 0);
		assert_eq!(slow.base.block_height(), 0);
	}

	#[tokio::test]
	async fn foreign_config_block_of_pending_signers_restarts() {
		let pending_keys = key_pairs(3);
		let hash = ConfigHash([5; 32]);
		let signers = node_ids(&pending_keys);
		let mut provider = MockConfigurationProvider::new();
		provider
			.expect_active_block_needs_configuration_change()
			.return_const(false);
		provider
			.expect_is_config_pending()
			.returning(move |_, pending| *pending == hash);
		provider
			.expect_pending_config_signers()
			.returning(move |_, _| Some(signers.clone()));
		let mut notifier = MockRestartNotifier::new();
		notifier
			.expect_notify_restart()
			.with(eq(true))
			.times(1)
			.return_const(());

		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_config_provider(provider)
			.with_restart_notifier(notifier);
		context.store().add_block(context.chain().next_block()).await.unwrap();

		let mut slow = waiting(&context, peer);
		let forged = foreign_header(hash);
		let block = foreign_block(&forged, witness(&forged, &pending_keys).encode());
		assert_eq!(slow.handle_block_range(peer, 1, vec![block]).await, Ok(1));
		assert_eq!(slow.wait_for_commits().await, Ok(true));
		assert!(slow.base.restart_requested());
		assert!(!slow.base.peers.is_blacklisted(&peer, 0));
		assert_eq!(context.store().last_block_height(), 0);
	}

	#[tokio::test]
	async fn status_with_invalid_height_is_rejected() {
		let peer = TestContext::new(4).peer(0);
		let mut communication = MockCommunicationManager::new();
		communication.expect_get_packets().times(1).returning(move || {
			vec![(
				peer,
				Message::Status {
					block_rid: None,
					height: i64::MIN,
					serial: 1,
				},
			)]
		});
		let context = TestContext::new(4)
			.with_communication(communication)
			.with_parameters(SyncParameters {
				max_errors_before_blacklisting: 1,
				..Default::default()
			});
		let mut slow = SlowSynchronizer::new(context.base());
		let mut sleep_data = SlowSyncSleepData::new(&slow.base.parameters);

		assert_eq!(slow.process_messages(&mut sleep_data).await, Ok(()));
		assert!(slow.base.peers.is_blacklisted(&peer, 0));
	}

	#[tokio::test]
	async fn slow_commits_apply_backpressure() {
		let peer = TestContext::new(4).peer(0);
		let context = TestContext::new(4)
			.with_communication(answering(peer))
			.with_parameters(SyncParameters {
				slow_sync_commit_wait_timeout: Duration::from_millis(10),
				..Default::default()
			});
		let mut database = MockBlockDatabase::new();
		database.expect_add_block().returning(|_| {
			Box::pin(async {
				sleep(Duration::from_secs(3600)).await;
				Ok(())
			})
		});
		let context = context.with_block_database(database);
		let mut chain = context.chain();
		let first = vec![complete(&chain.next_block(), 0)];
		let second = vec![complete(&chain.next_block(), 1)];

		let mut slow = waiting(&context, peer);
		assert_eq!(slow.handle_block_range(peer, 0, first).await, Ok(1));
		let now = slow.base.now();
		let base = &mut slow.base;
		slow.state_machine
			.maybe_get_block_range(now + 1, 0, |start_height, avoid| {
				send_request(base, start_height, avoid, now)
			});
		assert!(slow.state_machine.is_height_we_wait_for(1));

		// commit of the first range never completes, the second range is dropped
		assert_eq!(slow.handle_block_range(peer, 1, second).await, Ok(0));
		assert_eq!(slow.state_machine.state(), SlowSyncState::WaitForAction);
		assert_eq!(slow.state_machine.last_committed_height, -1);
	}

	#[tokio::test]
	async fn requests_avoid_last_peer() {
		let context = TestContext::new(4);
		let (first, second) = (context.peer(0), context.peer(1));
		let mut communication = MockCommunicationManager::new();
		communication
			.expect_configured_peers()
			.returning(move || vec![first, second]);
		communication
			.expect_send_to_random_peer()
			.returning(move |_, excluded| {
				assert!(excluded.contains(&first));
				(Some(second), HashSet::from([first, second]))
			});
		let context = context.with_communication(communication);
		let mut base = context.base();
		assert_eq!(send_request(&mut base, 0, Some(first), 0), Some(second));

		base.peers.unresponsive(first, "stale", 0);
		// only one candidate left, it is asked even though it answered last
		assert_eq!(send_request(&mut base, 0, Some(second), 0), Some(second));
	}

	#[tokio::test]
	async fn follows_tip_until_shutdown() {
		let context = TestContext::new(4);
		let peer = context.peer(0);
		let source = Arc::new(LedgerStore::new(
			MemoryDB::default(),
			peer,
			Arc::new(base_configuration(context.keys())),
		));
		let mut chain = context.chain();
		for _ in 0..25 {
			source.add_block(chain.next_block()).await.unwrap();
		}

		// the peer answers every block range request right away
		let pending = Arc::new(Mutex::new(vec![]));
		let mut communication = MockCommunicationManager::new();
		communication
			.expect_configured_peers()
			.returning(move || vec![peer]);
		let queued = pending.clone();
		communication
			.expect_send_to_random_peer()
			.returning(move |message, _| {
				let Message::GetBlockRange { start_height } = message else {
					panic!("block range request expected");
				};
				let mut blocks = vec![];
				let all_fit = pack_block_range(
					REPLICA,
					start_height,
					source.last_block_height(),
					|height| {
						source.block_at_height(height).map(|block| CompleteBlock {
							data: block.data,
							height,
							witness: block.witness,
						})
					},
					&mut blocks,
				);
				let range = Message::BlockRange {
					start_height,
					is_full: !all_fit,
					blocks,
				};
				queued.lock().unwrap().push((peer, range));
				(Some(peer), HashSet::from([peer]))
			});
		communication
			.expect_get_packets()
			.returning(move || std::mem::take(&mut *pending.lock().unwrap()));

		let context = context
			.with_communication(communication)
			.with_parameters(SyncParameters {
				slow_sync_min_sleep: Duration::from_millis(1),
				slow_sync_max_nap: Duration::from_millis(1),
				..Default::default()
			});
		let clock = context.clock().clone();
		let ticker = tokio::spawn(async move {
			loop {
				sleep(Duration::from_millis(1)).await;
				clock.advance(10);
			}
		});
		let shutdown = context.shutdown();
		let replica = context.store();
		let stopper = tokio::spawn(async move {
			while replica.last_block_height() < 24 {
				sleep(Duration::from_millis(5)).await;
			}
			let _ = shutdown.trigger_shutdown("tip reached".to_string());
		});

		let mut slow = SlowSynchronizer::new(context.base());
		timeout(Duration::from_secs(10), slow.sync_until_shutdown())
			.await
			.unwrap()
			.unwrap();
		stopper.await.unwrap();
		ticker.abort();
		assert_eq!(slow.base.block_height(), 24);
		assert_eq!(context.store().last_block_height(), 24);
	}
}

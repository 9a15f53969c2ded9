//! Multi-peer catch-up with one job per height.
//!
//! Jobs are dispatched to random syncable peers. Blocks are committed strictly in height
//! order, one commit at a time, and the synchronizer stops once no responsive peer has
//! blocks above our height.
use super::{BaseSynchronizer, CommitOutcome};
use crate::{
	error::CommitError,
	messages::{CompleteBlock, Message},
	types::{millis, BlockData, BlockDataWithWitness, BlockHeader, NodeId, Timestamp},
};
use std::{
	collections::{BTreeMap, HashSet},
	fmt,
};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
struct Job {
	height: i64,
	peer: NodeId,
	header: Option<BlockHeader>,
	raw_header: Vec<u8>,
	witness: Vec<u8>,
	block: Option<BlockDataWithWitness>,
	commit_error: Option<CommitError>,
	committing: bool,
	restart_failed: bool,
	start_time: Timestamp,
}

impl Job {
	fn new(height: i64, peer: NodeId, start_time: Timestamp) -> Self {
		Job {
			height,
			peer,
			header: None,
			raw_header: vec![],
			witness: vec![],
			block: None,
			commit_error: None,
			committing: false,
			restart_failed: false,
			start_time,
		}
	}
}

impl fmt::Display for Job {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.height, self.peer)
	}
}

pub struct FastSynchronizer {
	base: BaseSynchronizer,
	jobs: BTreeMap<i64, Job>,
}

impl FastSynchronizer {
	pub fn new(base: BaseSynchronizer) -> Self {
		FastSynchronizer {
			base,
			jobs: BTreeMap::new(),
		}
	}

	pub fn into_base(self) -> BaseSynchronizer {
		self.base
	}

	pub fn block_height(&self) -> i64 {
		self.base.block_height
	}

	/// Synchronizes until every responsive peer is drained, the node restarts, or shutdown.
	/// A chain divergence stops the synchronizer with an error.
	pub async fn sync_until_responsive_peers_drained(&mut self) -> Result<(), CommitError> {
		let deadline = self.base.now() + millis(self.base.parameters.exit_delay);
		for peer in self.base.context.communication.configured_peers() {
			self.base.peers.add_peer(peer);
		}
		self.base.block_height = self.base.context.block_queries.last_block_height();

		let result = self.sync_loop(deadline).await;
		self.drain_commits().await?;
		self.jobs.clear();
		result
	}

	async fn sync_loop(&mut self, deadline: Timestamp) -> Result<(), CommitError> {
		while self.base.is_running() {
			self.refill_jobs();
			self.process_messages();
			self.process_done_jobs()?;
			self.process_stale_jobs();
			if self.are_responsive_nodes_drained(deadline) {
				info!(height = self.base.block_height, "Responsive peers are drained");
				break;
			}
			sleep(self.base.parameters.loop_interval).await;
		}
		Ok(())
	}

	/// Waits for the commit in flight, the write must not be lost.
	async fn drain_commits(&mut self) -> Result<(), CommitError> {
		let wait = self.base.parameters.slow_sync_commit_wait_timeout;
		while self.jobs.values().any(|job| job.committing) {
			match timeout(wait, self.base.commit_receiver.recv()).await {
				Ok(Some(outcome)) => self.process_done_job(outcome)?,
				Ok(None) | Err(_) => {
					warn!("Commit in flight did not complete");
					break;
				},
			}
		}
		Ok(())
	}

	fn refill_jobs(&mut self) {
		while self.base.is_running() && self.jobs.len() < self.base.parameters.parallelism {
			let height = self
				.jobs
				.last_key_value()
				.map_or(self.base.block_height, |(height, _)| *height)
				.max(self.base.block_height)
				+ 1;
			if !self.start_job(height) {
				break;
			}
		}
	}

	/// Asks a random peer for the header and block at the height, falling back to
	/// peers which may speak only the complete block protocol.
	fn start_job(&mut self, height: i64) -> bool {
		let now = self.base.now();
		let communication = self.base.context.communication.clone();
		let excluded = self.base.peers.excl_non_syncable(height, now);
		let (peer, connected) =
			communication.send_to_random_peer(Message::GetBlockHeaderAndBlock { height }, &excluded);

		let (peer, connected) = match peer {
			Some(peer) => (peer, connected),
			None => {
				let legacy = self.base.peers.legacy_peers(height);
				if legacy.is_empty() {
					self.mark_connected(&connected);
					return false;
				}
				let excluded = communication
					.configured_peers()
					.into_iter()
					.filter(|peer| !legacy.contains(peer))
					.collect();
				let (peer, connected) =
					communication.send_to_random_peer(Message::GetBlockAtHeight { height }, &excluded);
				let Some(peer) = peer else {
					self.mark_connected(&connected);
					return false;
				};
				(peer, connected)
			},
		};

		self.mark_connected(&connected);
		self.base.peers.add_peer(peer);
		trace!(height, %peer, "Job started");
		self.jobs.insert(height, Job::new(height, peer, now));
		true
	}

	fn mark_connected(&mut self, connected: &HashSet<NodeId>) {
		let disconnected = self
			.base
			.context
			.communication
			.configured_peers()
			.into_iter()
			.filter(|peer| !connected.contains(peer))
			.collect();
		self.base.peers.mark_connected(connected);
		self.base.peers.mark_disconnected(&disconnected);
	}

	/// Restarts the job on another peer, or flags it for the next sweep if none is available.
	fn restart_job(&mut self, height: i64) {
		let Some(mut job) = self.jobs.remove(&height) else {
			return;
		};
		if !self.start_job(height) {
			debug!(height, "No peer to restart job, retrying later");
			job.restart_failed = true;
			job.header = None;
			job.raw_header.clear();
			job.witness.clear();
			job.block = None;
			job.committing = false;
			self.jobs.insert(height, job);
		}
	}

	/// Starts the commit of the lowest job if its block is complete.
	fn commit_jobs_as_necessary(&mut self) {
		if !self.base.is_running() || self.jobs.values().any(|job| job.committing) {
			return;
		}
		let Some(job) = self.jobs.get_mut(&(self.base.block_height + 1)) else {
			return;
		};
		if job.restart_failed {
			return;
		}
		let (Some(header), Some(block)) = (&job.header, &job.block) else {
			return;
		};
		let blocks = vec![(header.clone(), block.clone())];
		job.committing = true;
		if !self.base.spawn_commit(job.peer, blocks) {
			job.committing = false;
		}
	}

	fn process_done_jobs(&mut self) -> Result<(), CommitError> {
		while let Ok(outcome) = self.base.commit_receiver.try_recv() {
			self.process_done_job(outcome)?;
		}
		Ok(())
	}

	fn process_done_job(&mut self, outcome: CommitOutcome) -> Result<(), CommitError> {
		let CommitOutcome {
			height,
			peer,
			header,
			witness,
			result,
		} = outcome;
		let Some(mut job) = self.jobs.remove(&height) else {
			warn!(height, "Commit completed for an unknown job");
			return Ok(());
		};

		match result {
			Ok(()) => {
				self.base.block_height = height;
				debug!(height, "Fast sync committed block");
				self.refill_jobs();
				self.commit_jobs_as_necessary();
			},
			Err(CommitError::EngineClosed) => {
				debug!(height, "Engine closed, job dropped");
			},
			Err(CommitError::StorageAbort(error)) => {
				info!(height, %error, "Storage aborted commit, resubmitting");
				job.committing = false;
				job.commit_error = None;
				self.jobs.insert(height, job);
				self.commit_jobs_as_necessary();
			},
			Err(error @ CommitError::PrevBlockMismatch { .. }) => {
				self.base
					.handle_add_block_error(peer, &header, &witness, &error);
				return Err(error);
			},
			Err(error) => {
				if self.base.context.block_queries.last_block_height() >= height {
					info!(height, "Block was committed by someone else");
					self.base.block_height = height;
					self.refill_jobs();
					self.commit_jobs_as_necessary();
					return Ok(());
				}
				self.base
					.handle_add_block_error(peer, &header, &witness, &error);
				job.committing = false;
				job.commit_error = Some(error);
				if self.base.is_running() {
					self.jobs.insert(height, job);
					self.restart_job(height);
				} else {
					debug!(%job, "Job dropped");
				}
			},
		}
		Ok(())
	}

	/// Restarts jobs without progress. The capability of a stale peer is evaluated
	/// once per sweep: modern peers are marked unresponsive right away, peers which
	/// may speak only the legacy protocol get a grace period.
	fn process_stale_jobs(&mut self) {
		let now = self.base.now();
		let job_timeout = millis(self.base.parameters.job_timeout);
		let grace_cycles = self.base.parameters.legacy_grace_cycles;
		let mut evaluated = HashSet::new();
		let mut stale = vec![];

		for (height, job) in &self.jobs {
			if job.restart_failed {
				stale.push(*height);
				continue;
			}
			if job.committing || job.block.is_some() || job.start_time + job_timeout >= now {
				continue;
			}
			stale.push(*height);
			if job.header.is_some() || !evaluated.insert(job.peer) {
				continue;
			}

			let peers = &mut self.base.peers;
			if peers.is_confirmed_modern(&job.peer) {
				peers.unresponsive(
					job.peer,
					&format!("Sync: Marking modern peer for job {job} unresponsive"),
					now,
				);
			} else if peers.is_maybe_legacy(&job.peer) {
				if peers.add_legacy_strike(job.peer) >= grace_cycles {
					peers.set_maybe_legacy(job.peer, false);
					peers.unresponsive(
						job.peer,
						&format!("Sync: Marking potentially legacy peer for job {job} unresponsive"),
						now,
					);
				}
			} else {
				peers.set_maybe_legacy(job.peer, true);
			}
		}

		for height in stale {
			self.restart_job(height);
		}
	}

	/// Handles a header answer. Returns true if the header was accepted for its job.
	fn handle_block_header(
		&mut self,
		peer: NodeId,
		raw_header: Vec<u8>,
		witness: Vec<u8>,
		requested_height: i64,
	) -> bool {
		let now = self.base.now();
		let Some(job) = self.jobs.get(&requested_height) else {
			self.base.blacklist(
				peer,
				&format!("Sync: Why do we receive a header for a block height not in our job list? Height: {requested_height}"),
			);
			return false;
		};
		if job.peer != peer {
			self.base.blacklist(
				peer,
				&format!("Sync: Why do we receive a header from a peer when we didn't ask this peer? Job: {job}"),
			);
			return false;
		}
		if job.header.is_some() {
			self.base.blacklist(
				peer,
				&format!("Sync: Why do we receive a header when we already have the header? Job: {job}"),
			);
			return false;
		}

		if raw_header.is_empty() {
			if witness.is_empty() {
				// peer has nothing at or above the requested height
				self.base.peers.drained(peer, requested_height - 1, now);
				self.restart_job(requested_height);
			} else {
				self.base
					.blacklist(peer, "Sync: Why did we get a witness without a header?");
			}
			return false;
		}

		let header = match self
			.base
			.context
			.configuration
			.decode_block_header(&raw_header)
		{
			Ok(header) => header,
			Err(error) => {
				self.base
					.blacklist(peer, &format!("Sync: Cannot decode header ({error})"));
				return false;
			},
		};
		if header.height < requested_height {
			// peer sent its tip, it has nothing above
			self.base.peers.drained(peer, header.height, now);
			self.restart_job(requested_height);
			return false;
		}
		if header.height > requested_height {
			self.base.blacklist(
				peer,
				&format!(
					"Sync: Header height {} is above the requested height {requested_height}",
					header.height
				),
			);
			return false;
		}
		if let Err(error) = self.base.check_witness(&header, &witness) {
			self.base.blacklist(
				peer,
				&format!("Sync: Invalid header received ({error}). Height: {requested_height}"),
			);
			return false;
		}

		if let Some(job) = self.jobs.get_mut(&requested_height) {
			job.header = Some(header);
			job.raw_header = raw_header;
			job.witness = witness;
		}
		self.base.peers.header_received(peer, requested_height);
		true
	}

	fn handle_unfinished_block(&mut self, peer: NodeId, raw_header: Vec<u8>, transactions: Vec<Vec<u8>>) {
		let header = match self
			.base
			.context
			.configuration
			.decode_block_header(&raw_header)
		{
			Ok(header) => header,
			Err(error) => {
				self.base
					.blacklist(peer, &format!("Sync: Cannot decode unfinished block header ({error})"));
				return;
			},
		};
		let height = header.height;
		let Some(job) = self.jobs.get_mut(&height) else {
			self.base.blacklist(
				peer,
				&format!("Sync: Why did we get an unfinished block of height {height}? We don't have a job for it."),
			);
			return;
		};
		let violation = if job.block.is_some() {
			Some("Sync: Why did we get the unfinished block twice?")
		} else if job.peer != peer {
			Some("Sync: Why did we get an unfinished block from a peer we didn't ask?")
		} else if job.header.is_none() {
			Some("Sync: Why did we get an unfinished block before the header?")
		} else if job.raw_header != raw_header {
			Some("Sync: Unfinished block header doesn't match the received header")
		} else {
			None
		};
		if let Some(reason) = violation {
			self.base.blacklist(peer, &format!("{reason} Job: {height}"));
			return;
		}

		job.block = Some(BlockDataWithWitness {
			data: BlockData {
				header: raw_header,
				transactions,
			},
			witness: job.witness.clone(),
		});
		self.commit_jobs_as_necessary();
	}

	/// Complete blocks are answers of legacy peers only.
	fn handle_complete_block(&mut self, peer: NodeId, block: CompleteBlock) {
		if !self.base.peers.is_maybe_legacy(&peer) {
			trace!(%peer, height = block.height, "Ignoring complete block of a non legacy peer");
			return;
		}
		let CompleteBlock {
			data,
			height,
			witness,
		} = block;
		if self.handle_block_header(peer, data.header.clone(), witness, height) {
			self.handle_unfinished_block(peer, data.header, data.transactions);
		}
	}

	fn process_messages(&mut self) {
		let now = self.base.now();
		for (peer, message) in self.base.context.communication.get_packets() {
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
				Message::BlockHeader {
					header,
					witness,
					requested_height,
				} => {
					self.handle_block_header(peer, header, witness, requested_height);
				},
				Message::UnfinishedBlock {
					header,
					transactions,
				} => self.handle_unfinished_block(peer, header, transactions),
				Message::CompleteBlock(block) => self.handle_complete_block(peer, block),
				Message::Status { height, .. } => self.base.status_received(peer, height),
				Message::AppliedConfig {
					config_hash,
					height,
				} => {
					if self
						.base
						.check_if_we_need_to_apply_pending_config(peer, config_hash, height)
					{
						return;
					}
				},
				other => trace!(%peer, message = other.name(), "Ignoring message"),
			}
		}
	}

	/// No connected peer can give us the next block and the exit delay elapsed.
	fn are_responsive_nodes_drained(&mut self, deadline: Timestamp) -> bool {
		let now = self.base.now();
		now > deadline
			&& self.base.block_height >= self.base.parameters.must_sync_until_height
			&& self
				.base
				.peers
				.syncable_and_connected(self.base.block_height + 1, now)
				.is_empty()
	}
}

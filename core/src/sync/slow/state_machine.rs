use crate::types::{NodeId, Timestamp};
use std::fmt;
use strum::Display;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SlowSyncState {
	WaitForAction,
	WaitForReply,
}

/// Tracks the single block range request slow sync may have in flight.
///
/// The only transitions are `WaitForAction -> WaitForReply` on a sent request,
/// and back on a handled reply or a timed out peer.
#[derive(Debug)]
pub struct SlowSyncStateMachine {
	state: SlowSyncState,
	wait_for_peer: Option<NodeId>,
	wait_for_height: Option<i64>,
	/// When the last block range was requested
	wait_time: Timestamp,
	/// When we started idling before the next request
	idle_time: Timestamp,
	max_peer_wait: i64,
	pub(crate) last_uncommitted_height: i64,
	pub(crate) last_committed_height: i64,
	has_failed_commit: bool,
}

impl fmt::Display for SlowSyncStateMachine {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"state: {}, wait for height: {:?}, last uncommitted: {}, last committed: {}",
			self.state, self.wait_for_height, self.last_uncommitted_height, self.last_committed_height
		)
	}
}

impl SlowSyncStateMachine {
	pub fn new(height: i64, max_peer_wait: i64) -> Self {
		SlowSyncStateMachine {
			state: SlowSyncState::WaitForAction,
			wait_for_peer: None,
			wait_for_height: None,
			wait_time: 0,
			idle_time: 0,
			max_peer_wait,
			last_uncommitted_height: height,
			last_committed_height: height,
			has_failed_commit: false,
		}
	}

	pub fn state(&self) -> SlowSyncState {
		self.state
	}

	pub fn is_height_we_wait_for(&self, height: i64) -> bool {
		self.wait_for_height == Some(height)
	}

	pub fn is_peer_we_wait_for(&self, peer: &NodeId) -> bool {
		self.wait_for_peer.as_ref() == Some(peer)
	}

	pub fn start_height(&self) -> i64 {
		self.last_uncommitted_height + 1
	}

	/// Requests the next block range once the sleep is over, or from another peer
	/// once the awaited one took too long.
	///
	/// `send` gets the start height and the peer to avoid, and returns the peer asked.
	pub fn maybe_get_block_range<F>(&mut self, now: Timestamp, current_sleep: i64, mut send: F)
	where
		F: FnMut(i64, Option<NodeId>) -> Option<NodeId>,
	{
		let start_height = self.start_height();
		let avoid = match self.state {
			SlowSyncState::WaitForAction if now > self.idle_time + current_sleep => None,
			SlowSyncState::WaitForAction => return,
			SlowSyncState::WaitForReply if now > self.wait_time + self.max_peer_wait => {
				debug!(height = ?self.wait_for_height, "Waited too long for block range, asking another peer");
				let avoid = self.wait_for_peer;
				self.reset_to_wait_for_action(now);
				avoid
			},
			SlowSyncState::WaitForReply => return,
		};
		if let Some(peer) = send(start_height, avoid) {
			self.acknowledge_failed_commit();
			self.update_to_wait_for_reply(peer, start_height, now);
		}
	}

	fn update_to_wait_for_reply(&mut self, peer: NodeId, start_height: i64, now: Timestamp) {
		self.state = SlowSyncState::WaitForReply;
		self.wait_for_peer = Some(peer);
		self.wait_for_height = Some(start_height);
		self.wait_time = now;
	}

	pub fn update_uncommitted_height(&mut self, height: i64) {
		if height < self.last_uncommitted_height {
			warn!(height, machine = %self, "Uncommitted height cannot decrease");
			return;
		}
		self.last_uncommitted_height = height;
	}

	pub fn update_after_successful_commit(&mut self, height: i64) {
		if self.last_committed_height + 1 != height {
			warn!(height, machine = %self, "Committed height is not the next one");
		}
		if height > self.last_uncommitted_height {
			warn!(height, machine = %self, "Committed a block we did not wait for");
			return;
		}
		self.last_committed_height = height;
	}

	/// Later blocks of the range depend on the failed one, sync resumes after the last commit.
	pub fn update_after_failed_commit(&mut self, height: i64) {
		warn!(height, last_committed = self.last_committed_height, "Block commit failed");
		self.last_uncommitted_height = self.last_committed_height;
		self.has_failed_commit = true;
	}

	pub fn is_waiting_for_blocks_to_commit(&self) -> bool {
		self.last_committed_height < self.last_uncommitted_height
	}

	pub fn reset_to_wait_for_action(&mut self, now: Timestamp) {
		self.state = SlowSyncState::WaitForAction;
		self.wait_for_peer = None;
		self.wait_for_height = None;
		self.idle_time = now;
	}

	pub fn has_unacknowledged_failed_commit(&self) -> bool {
		self.has_failed_commit
	}

	pub fn acknowledge_failed_commit(&mut self) {
		self.has_failed_commit = false;
	}
}

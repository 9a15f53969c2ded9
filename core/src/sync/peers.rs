//! Peer reputation bookkeeping shared by the fast and slow synchronizers.
use super::configuration::SyncParameters;
use crate::types::{NodeId, Timestamp, NO_HEIGHT};
use std::collections::{HashMap, HashSet, VecDeque};
use strum::Display;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PeerState {
	#[default]
	Syncable,
	Unresponsive,
	Blacklisted,
	/// Peer has no blocks above its drained height
	Drained,
}

/// Protocol support observed from the peer's traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum PeerCapability {
	#[default]
	Unknown,
	/// Possibly speaks only the complete block protocol
	Legacy,
	/// Answers header and block requests, never downgraded
	Modern,
}

#[derive(Clone, Debug)]
pub struct KnownState {
	state: PeerState,
	capability: PeerCapability,
	connected: bool,
	drained_height: i64,
	drained_at: Timestamp,
	unresponsive_at: Timestamp,
	blacklisted_at: Timestamp,
	errors: VecDeque<Timestamp>,
	legacy_strikes: usize,
}

impl Default for KnownState {
	fn default() -> Self {
		KnownState {
			state: PeerState::Syncable,
			capability: PeerCapability::Unknown,
			connected: true,
			drained_height: NO_HEIGHT,
			drained_at: 0,
			unresponsive_at: 0,
			blacklisted_at: 0,
			errors: VecDeque::new(),
			legacy_strikes: 0,
		}
	}
}

impl KnownState {
	pub fn state(&self) -> PeerState {
		self.state
	}

	pub fn capability(&self) -> PeerCapability {
		self.capability
	}

	pub fn is_connected(&self) -> bool {
		self.connected
	}

	pub fn is_blacklisted(&self) -> bool {
		self.state == PeerState::Blacklisted
	}

	pub fn is_drained(&self) -> bool {
		self.state == PeerState::Drained
	}

	/// Drained peers are still syncable for heights they have.
	pub fn is_syncable(&self, height: i64) -> bool {
		match self.state {
			PeerState::Syncable => true,
			PeerState::Drained => height <= self.drained_height,
			PeerState::Unresponsive | PeerState::Blacklisted => false,
		}
	}

	pub fn is_unresponsive(&self, now: Timestamp, resurrect_after: i64) -> bool {
		self.state == PeerState::Unresponsive && now <= self.unresponsive_at + resurrect_after
	}

	pub fn drained(&mut self, height: i64, now: Timestamp) {
		match self.state {
			PeerState::Blacklisted => return,
			PeerState::Drained => self.drained_height = self.drained_height.max(height),
			PeerState::Syncable | PeerState::Unresponsive => self.drained_height = height,
		}
		self.state = PeerState::Drained;
		self.drained_at = now;
	}

	/// Peer proved it has a block above its drained height.
	pub fn header_received(&mut self, height: i64) {
		if self.state == PeerState::Drained && height > self.drained_height {
			self.state = PeerState::Syncable;
		}
	}

	pub fn unresponsive(&mut self, now: Timestamp) {
		if self.state != PeerState::Blacklisted {
			self.state = PeerState::Unresponsive;
			self.unresponsive_at = now;
		}
	}

	/// Gives drained and unresponsive peers another chance once their time is up.
	pub fn resurrect(&mut self, now: Timestamp, parameters: &SyncParameters) {
		let resurrect = match self.state {
			PeerState::Drained => now > self.drained_at + parameters.resurrect_drained_millis(),
			PeerState::Unresponsive => {
				!self.is_unresponsive(now, parameters.resurrect_unresponsive_millis())
			},
			PeerState::Syncable | PeerState::Blacklisted => false,
		};
		if resurrect {
			self.state = PeerState::Syncable;
		}
	}

	fn prune_errors(&mut self, now: Timestamp, error_timeout: i64) {
		while self
			.errors
			.front()
			.is_some_and(|error| *error <= now - error_timeout)
		{
			self.errors.pop_front();
		}
	}

	/// Records an error, returns true if the peer got blacklisted by it.
	pub fn blacklist(&mut self, now: Timestamp, parameters: &SyncParameters) -> bool {
		self.prune_errors(now, parameters.blacklisting_error_timeout_millis());
		self.errors.push_back(now);
		let over_threshold = self.errors.len() >= parameters.max_errors_before_blacklisting;
		match (self.is_blacklisted(), over_threshold) {
			(false, true) => {
				self.state = PeerState::Blacklisted;
				self.blacklisted_at = now;
				true
			},
			(true, false) => {
				self.state = PeerState::Syncable;
				false
			},
			_ => false,
		}
	}

	/// Lifts an expired blacklisting and reports whether the peer is still blacklisted.
	pub fn update_and_check_blacklisted(
		&mut self,
		now: Timestamp,
		parameters: &SyncParameters,
	) -> bool {
		self.prune_errors(now, parameters.blacklisting_error_timeout_millis());
		if self.is_blacklisted() && now > self.blacklisted_at + parameters.blacklisting_timeout_millis()
		{
			self.state = PeerState::Syncable;
			self.errors.clear();
		}
		self.is_blacklisted()
	}

	pub fn confirm_modern(&mut self) {
		self.capability = PeerCapability::Modern;
		self.legacy_strikes = 0;
	}

	pub fn set_maybe_legacy(&mut self, maybe_legacy: bool) {
		if self.capability == PeerCapability::Modern {
			return;
		}
		self.capability = if maybe_legacy {
			PeerCapability::Legacy
		} else {
			PeerCapability::Unknown
		};
		self.legacy_strikes = 0;
	}

	pub fn is_maybe_legacy(&self) -> bool {
		self.capability == PeerCapability::Legacy
	}

	pub fn is_confirmed_modern(&self) -> bool {
		self.capability == PeerCapability::Modern
	}
}

/// Reputation of all peers of a blockchain, owned by one synchronizer loop.
#[derive(Debug)]
pub struct PeerStatuses {
	parameters: SyncParameters,
	states: HashMap<NodeId, KnownState>,
}

impl PeerStatuses {
	pub fn new(parameters: SyncParameters) -> Self {
		PeerStatuses {
			parameters,
			states: HashMap::new(),
		}
	}

	pub fn state(&self, peer: &NodeId) -> Option<&KnownState> {
		self.states.get(peer)
	}

	fn entry(&mut self, peer: NodeId) -> &mut KnownState {
		self.states.entry(peer).or_default()
	}

	pub fn add_peer(&mut self, peer: NodeId) {
		self.entry(peer);
	}

	pub fn mark_connected(&mut self, peers: &HashSet<NodeId>) {
		for peer in peers {
			self.entry(*peer).connected = true;
		}
	}

	pub fn mark_disconnected(&mut self, peers: &HashSet<NodeId>) {
		for peer in peers {
			self.entry(*peer).connected = false;
		}
	}

	/// Records a protocol error of the peer, blacklisting it once errors pile up.
	pub fn maybe_blacklist(&mut self, peer: NodeId, reason: &str, now: Timestamp) -> bool {
		let parameters = self.parameters.clone();
		let blacklisted = self.entry(peer).blacklist(now, &parameters);
		if blacklisted {
			info!(%peer, reason, "Peer blacklisted");
		} else {
			debug!(%peer, reason, "Peer error recorded");
		}
		blacklisted
	}

	pub fn unresponsive(&mut self, peer: NodeId, reason: &str, now: Timestamp) {
		debug!(%peer, reason, "Peer unresponsive");
		self.entry(peer).unresponsive(now);
	}

	pub fn drained(&mut self, peer: NodeId, height: i64, now: Timestamp) {
		debug!(%peer, height, "Peer drained");
		self.entry(peer).drained(height, now);
	}

	pub fn header_received(&mut self, peer: NodeId, height: i64) {
		self.entry(peer).header_received(height);
	}

	/// Status gossip, the peer has blocks up to the given height.
	pub fn status_received(&mut self, peer: NodeId, height: i64) {
		self.entry(peer).header_received(height);
	}

	pub fn confirm_modern(&mut self, peer: NodeId) {
		self.entry(peer).confirm_modern();
	}

	pub fn set_maybe_legacy(&mut self, peer: NodeId, maybe_legacy: bool) {
		self.entry(peer).set_maybe_legacy(maybe_legacy);
	}

	pub fn is_maybe_legacy(&self, peer: &NodeId) -> bool {
		self.states.get(peer).is_some_and(KnownState::is_maybe_legacy)
	}

	pub fn is_confirmed_modern(&self, peer: &NodeId) -> bool {
		self.states
			.get(peer)
			.is_some_and(KnownState::is_confirmed_modern)
	}

	/// Counts a stale sweep against a potentially legacy peer.
	pub fn add_legacy_strike(&mut self, peer: NodeId) -> usize {
		let state = self.entry(peer);
		state.legacy_strikes += 1;
		state.legacy_strikes
	}

	pub fn is_blacklisted(&mut self, peer: &NodeId, now: Timestamp) -> bool {
		let parameters = &self.parameters;
		self.states
			.get_mut(peer)
			.is_some_and(|state| state.update_and_check_blacklisted(now, parameters))
	}

	pub fn is_syncable(&self, peer: &NodeId, height: i64) -> bool {
		self.states
			.get(peer)
			.map_or(true, |state| state.is_syncable(height))
	}

	fn refresh(&mut self, now: Timestamp) {
		let parameters = &self.parameters;
		for state in self.states.values_mut() {
			state.update_and_check_blacklisted(now, parameters);
			state.resurrect(now, parameters);
		}
	}

	/// Peers not to be asked for the given height with the header and block protocol.
	/// Unknown peers are not excluded.
	pub fn excl_non_syncable(&mut self, height: i64, now: Timestamp) -> HashSet<NodeId> {
		self.refresh(now);
		self.states
			.iter()
			.filter(|(_, state)| !state.is_syncable(height) || state.is_maybe_legacy())
			.map(|(peer, _)| *peer)
			.collect()
	}

	/// Peers not to be asked for a block range starting at the given height.
	pub fn non_syncable(&mut self, height: i64, now: Timestamp) -> HashSet<NodeId> {
		self.refresh(now);
		self.states
			.iter()
			.filter(|(_, state)| !state.is_syncable(height))
			.map(|(peer, _)| *peer)
			.collect()
	}

	pub fn legacy_peers(&self, height: i64) -> HashSet<NodeId> {
		self.states
			.iter()
			.filter(|(_, state)| state.is_maybe_legacy() && state.is_syncable(height))
			.map(|(peer, _)| *peer)
			.collect()
	}

	pub fn syncable_and_connected(&mut self, height: i64, now: Timestamp) -> HashSet<NodeId> {
		self.refresh(now);
		self.states
			.iter()
			.filter(|(_, state)| state.is_connected() && state.is_syncable(height))
			.map(|(peer, _)| *peer)
			.collect()
	}

	pub fn clear(&mut self) {
		self.states.clear();
	}
}

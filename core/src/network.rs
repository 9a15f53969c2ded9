use crate::{messages::Message, types::NodeId};
use mockall::automock;
use std::collections::HashSet;

pub mod memory;

/// Peer-to-peer transport of a single blockchain.
#[automock]
pub trait CommunicationManager: Send + Sync {
	/// Drains all buffered inbound messages.
	fn get_packets(&self) -> Vec<(NodeId, Message)>;

	fn send_packet(&self, message: Message, recipient: NodeId);

	fn broadcast_packet(&self, message: Message);

	/// Sends the message to a random connected peer not in `excluded`.
	/// Returns the chosen peer, if any, and the currently connected peers.
	fn send_to_random_peer(
		&self,
		message: Message,
		excluded: &HashSet<NodeId>,
	) -> (Option<NodeId>, HashSet<NodeId>);

	/// Peers configured for the blockchain, connected or not.
	fn configured_peers(&self) -> Vec<NodeId>;
}

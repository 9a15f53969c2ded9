//! In-process transport connecting nodes through unbounded channels.
use super::CommunicationManager;
use crate::{messages::Message, types::NodeId};
use rand::seq::IteratorRandom;
use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex, PoisonError, RwLock},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

type Packet = (NodeId, Vec<u8>);

#[derive(Clone, Default)]
pub struct MemoryNetwork {
	mailboxes: Arc<RwLock<HashMap<NodeId, UnboundedSender<Packet>>>>,
}

impl MemoryNetwork {
	/// Registers the node and returns its connection to the given peers.
	pub fn connect(&self, node_id: NodeId, peers: Vec<NodeId>) -> MemoryConnection {
		let (sender, receiver) = unbounded_channel();
		self.mailboxes
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(node_id, sender);
		MemoryConnection {
			node_id,
			peers: peers.into_iter().filter(|peer| *peer != node_id).collect(),
			network: self.clone(),
			receiver: Mutex::new(receiver),
		}
	}

	/// Removes the node, messages sent to it are dropped afterwards.
	pub fn disconnect(&self, node_id: &NodeId) {
		self.mailboxes
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(node_id);
	}

	fn is_connected(&self, node_id: &NodeId) -> bool {
		self.mailboxes
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.contains_key(node_id)
	}

	fn deliver(&self, from: NodeId, to: NodeId, bytes: Vec<u8>) -> bool {
		let mailboxes = self.mailboxes.read().unwrap_or_else(PoisonError::into_inner);
		let Some(mailbox) = mailboxes.get(&to) else {
			return false;
		};
		mailbox.send((from, bytes)).is_ok()
	}
}

pub struct MemoryConnection {
	node_id: NodeId,
	peers: Vec<NodeId>,
	network: MemoryNetwork,
	receiver: Mutex<UnboundedReceiver<Packet>>,
}

impl MemoryConnection {
	pub fn node_id(&self) -> NodeId {
		self.node_id
	}

	fn connected_peers(&self) -> HashSet<NodeId> {
		self.peers
			.iter()
			.filter(|peer| self.network.is_connected(peer))
			.copied()
			.collect()
	}
}

impl CommunicationManager for MemoryConnection {
	fn get_packets(&self) -> Vec<(NodeId, Message)> {
		let mut receiver = self.receiver.lock().unwrap_or_else(PoisonError::into_inner);
		let mut packets = vec![];
		while let Ok((peer, bytes)) = receiver.try_recv() {
			match Message::from_bytes(&bytes) {
				Ok(message) => packets.push((peer, message)),
				Err(error) => warn!(%error, %peer, "Dropping undecodable packet"),
			}
		}
		packets
	}

	fn send_packet(&self, message: Message, recipient: NodeId) {
		trace!(peer = %recipient, message = message.name(), "Sending packet");
		if !self.network.deliver(self.node_id, recipient, message.to_bytes()) {
			trace!(peer = %recipient, "Peer is not connected");
		}
	}

	fn broadcast_packet(&self, message: Message) {
		let bytes = message.to_bytes();
		for peer in &self.peers {
			self.network.deliver(self.node_id, *peer, bytes.clone());
		}
	}

	fn send_to_random_peer(
		&self,
		message: Message,
		excluded: &HashSet<NodeId>,
	) -> (Option<NodeId>, HashSet<NodeId>) {
		let connected = self.connected_peers();
		let peer = connected
			.iter()
			.filter(|peer| !excluded.contains(peer))
			.choose(&mut rand::thread_rng())
			.copied();
		if let Some(peer) = peer {
			self.send_packet(message, peer);
		}
		(peer, connected)
	}

	fn configured_peers(&self) -> Vec<NodeId> {
		self.peers.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn id(byte: u8) -> NodeId {
		NodeId([byte; 32])
	}

	#[test]
	fn delivers_to_connected_peers() {
		let network = MemoryNetwork::default();
		let first = network.connect(id(1), vec![id(1), id(2)]);
		let second = network.connect(id(2), vec![id(1)]);

		first.send_packet(Message::GetBlockAtHeight { height: 3 }, id(2));
		assert_eq!(
			second.get_packets(),
			vec![(id(1), Message::GetBlockAtHeight { height: 3 })]
		);
		assert!(second.get_packets().is_empty());
		assert_eq!(first.configured_peers(), vec![id(2)]);
	}

	#[test]
	fn random_peer_respects_exclusions_and_connectivity() {
		let network = MemoryNetwork::default();
		let node = network.connect(id(1), vec![id(2), id(3), id(4)]);
		let _second = network.connect(id(2), vec![]);
		let third = network.connect(id(3), vec![]);

		let excluded = HashSet::from([id(2)]);
		let (peer, connected) =
			node.send_to_random_peer(Message::GetBlockRange { start_height: 0 }, &excluded);
		assert_eq!(peer, Some(id(3)));
		assert_eq!(connected, HashSet::from([id(2), id(3)]));
		assert_eq!(third.get_packets().len(), 1);

		network.disconnect(&id(3));
		let (peer, connected) =
			node.send_to_random_peer(Message::GetBlockRange { start_height: 0 }, &excluded);
		assert_eq!(peer, None);
		assert_eq!(connected, HashSet::from([id(2)]));
	}
}

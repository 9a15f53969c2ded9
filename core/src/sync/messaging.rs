//! Answers block requests of peers which synchronize from this node.
use super::block_packer::pack_block_range;
use crate::{
	data::BlockQueries,
	messages::{CompleteBlock, Message},
	network::CommunicationManager,
	shutdown::Controller,
	types::{BlockHeader, BlockRid, NodeId, NO_HEIGHT},
};
use codec::Decode;
use color_eyre::{eyre::eyre, Result};
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace};

/// Header and witness of our tip, sent to every peer asking above it.
struct TipHeader {
	height: i64,
	header: Vec<u8>,
	witness: Vec<u8>,
}

pub struct ResponseServer {
	communication: Arc<dyn CommunicationManager>,
	block_queries: Arc<dyn BlockQueries>,
	tip: Option<TipHeader>,
	status_serial: u64,
}

impl ResponseServer {
	pub fn new(
		communication: Arc<dyn CommunicationManager>,
		block_queries: Arc<dyn BlockQueries>,
	) -> Self {
		ResponseServer {
			communication,
			block_queries,
			tip: None,
			status_serial: 0,
		}
	}

	/// Dispatches a request message, other messages are ignored.
	pub fn handle_request(&mut self, peer: NodeId, message: Message) {
		let result = match message {
			Message::GetBlockAtHeight { height } => {
				self.send_block_at_height(peer, height);
				Ok(())
			},
			Message::GetBlockRange { start_height } => {
				self.send_block_range_from_height(peer, start_height);
				Ok(())
			},
			Message::GetBlockHeaderAndBlock { height } => self.send_block_header_and_block(peer, height),
			Message::GetBlockSignature { block_rid } => {
				self.send_block_signature(peer, block_rid);
				Ok(())
			},
			other => {
				trace!(%peer, message = other.name(), "Not a request");
				Ok(())
			},
		};
		if let Err(error) = result {
			debug!(%error, %peer, "Failed to answer request");
		}
	}

	fn complete_block(&self, height: i64) -> Option<CompleteBlock> {
		self.block_queries
			.block_at_height(height)
			.map(|block| CompleteBlock {
				data: block.data,
				height,
				witness: block.witness,
			})
	}

	pub fn send_block_at_height(&self, peer: NodeId, height: i64) {
		let Some(block) = self.complete_block(height) else {
			trace!(%peer, height, "No block to send");
			return;
		};
		self.communication
			.send_packet(Message::CompleteBlock(block), peer);
	}

	pub fn send_block_range_from_height(&self, peer: NodeId, start_height: i64) {
		let my_height = self.block_queries.last_block_height();
		let mut blocks = vec![];
		let all_fit = pack_block_range(
			peer,
			start_height,
			my_height,
			|height| self.complete_block(height),
			&mut blocks,
		);
		trace!(%peer, start_height, blocks = blocks.len(), "Sending block range");
		self.communication.send_packet(
			Message::BlockRange {
				start_height,
				is_full: !all_fit,
				blocks,
			},
			peer,
		);
	}

	fn tip_header(&mut self, my_height: i64) -> Result<&TipHeader> {
		if self.tip.as_ref().map(|tip| tip.height) != Some(my_height) {
			let block = self
				.block_queries
				.block_at_height(my_height)
				.ok_or_else(|| eyre!("Block at height: {my_height} doesn't exist."))?;
			self.tip = Some(TipHeader {
				height: my_height,
				header: block.data.header,
				witness: block.witness,
			});
		}
		self.tip
			.as_ref()
			.ok_or_else(|| eyre!("Block at height: {my_height} doesn't exist."))
	}

	/// Sends the header and the block at the requested height. If we don't have it,
	/// an empty header (nothing at all) or our tip header tells the peer we are drained.
	pub fn send_block_header_and_block(&mut self, peer: NodeId, requested_height: i64) -> Result<()> {
		let my_height = self.block_queries.last_block_height();
		if my_height == NO_HEIGHT {
			self.communication.send_packet(
				Message::BlockHeader {
					header: vec![],
					witness: vec![],
					requested_height,
				},
				peer,
			);
			return Ok(());
		}

		if my_height < requested_height {
			let tip = self.tip_header(my_height)?;
			let message = Message::BlockHeader {
				header: tip.header.clone(),
				witness: tip.witness.clone(),
				requested_height,
			};
			self.communication.send_packet(message, peer);
			return Ok(());
		}

		let block = self
			.block_queries
			.block_at_height(requested_height)
			.ok_or_else(|| eyre!("Block at height: {requested_height} doesn't exist."))?;
		self.communication.send_packet(
			Message::BlockHeader {
				header: block.data.header.clone(),
				witness: block.witness.clone(),
				requested_height,
			},
			peer,
		);
		if requested_height == my_height {
			self.tip = Some(TipHeader {
				height: my_height,
				header: block.data.header.clone(),
				witness: block.witness,
			});
		}
		self.communication.send_packet(
			Message::UnfinishedBlock {
				header: block.data.header,
				transactions: block.data.transactions,
			},
			peer,
		);
		Ok(())
	}

	pub fn send_block_signature(&self, peer: NodeId, block_rid: BlockRid) {
		match self.block_queries.block_signature(&block_rid) {
			Some(signature) => self
				.communication
				.send_packet(Message::BlockSignature { block_rid, signature }, peer),
			None => debug!(%peer, %block_rid, "No signature for block"),
		}
	}

	/// Status of the ledger, the height is the one of the next block.
	pub fn status(&mut self) -> Message {
		let height = self.block_queries.last_block_height();
		let block_rid = self
			.block_queries
			.block_at_height(height)
			.and_then(|block| BlockHeader::decode(&mut &block.data.header[..]).ok())
			.map(|header| header.rid());
		self.status_serial += 1;
		Message::Status {
			block_rid,
			height: height + 1,
			serial: self.status_serial,
		}
	}

	pub fn broadcast_status(&mut self) {
		let status = self.status();
		self.communication.broadcast_packet(status);
	}
}

/// Serves block requests until shutdown, gossiping the status on every status interval.
pub async fn serve(
	mut server: ResponseServer,
	communication: Arc<dyn CommunicationManager>,
	poll_interval: Duration,
	status_interval: Duration,
	shutdown: Controller<String>,
) {
	let mut poll = interval(poll_interval);
	poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
	let mut status = interval(status_interval);
	status.set_missed_tick_behavior(MissedTickBehavior::Skip);
	let serve = async {
		loop {
			tokio::select! {
				_ = poll.tick() => {
					for (peer, message) in communication.get_packets() {
						server.handle_request(peer, message);
					}
				},
				_ = status.tick() => server.broadcast_status(),
			}
		}
	};
	if let Err(reason) = shutdown.with_cancel(serve).await {
		info!(%reason, "Response server stopped");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		chain::node_id,
		data::{BlockDatabase, LedgerStore, MemoryDB, MockBlockQueries},
		network::MockCommunicationManager,
		sync::block_packer::MAX_BLOCKS_IN_PACKAGE,
		test_utils::{base_configuration, key_pairs, ChainBuilder},
		types::BlockDataWithWitness,
	};
	use mockall::predicate::{always, eq};
	use std::sync::Mutex;

	async fn ledger(height: i64) -> (Arc<LedgerStore<MemoryDB>>, ChainBuilder) {
		let keys = key_pairs(4);
		let configuration = Arc::new(base_configuration(&keys));
		let store = Arc::new(LedgerStore::new(MemoryDB::default(), node_id(&keys[0]), configuration));
		let mut chain = ChainBuilder::new(keys);
		for _ in 0..=height {
			store.add_block(chain.next_block()).await.unwrap();
		}
		(store, chain)
	}

	fn recording_communication() -> (MockCommunicationManager, Arc<Mutex<Vec<Message>>>) {
		let sent = Arc::new(Mutex::new(vec![]));
		let mut communication = MockCommunicationManager::new();
		let recorded = sent.clone();
		communication
			.expect_send_packet()
			.with(always(), eq(NodeId([7; 32])))
			.returning(move |message, _| recorded.lock().unwrap().push(message));
		(communication, sent)
	}

	const PEER: NodeId = NodeId([7; 32]);

	#[tokio::test]
	async fn block_range_from_small_blocks_is_full_count() {
		let (store, _) = ledger(10).await;
		let (communication, sent) = recording_communication();
		let server = ResponseServer::new(Arc::new(communication), store);
		server.send_block_range_from_height(PEER, 1);

		let sent = sent.lock().unwrap();
		let Message::BlockRange {
			start_height,
			is_full,
			blocks,
		} = &sent[0]
		else {
			panic!("Expected block range");
		};
		assert_eq!(*start_height, 1);
		assert!(!is_full);
		assert_eq!(blocks.len(), MAX_BLOCKS_IN_PACKAGE);
		assert_eq!(blocks[0].height, 1);
		assert_eq!(blocks[9].height, 10);
	}

	#[tokio::test]
	async fn empty_ledger_sends_empty_header() {
		let (communication, sent) = recording_communication();
		let mut queries = MockBlockQueries::new();
		queries.expect_last_block_height().return_const(-1i64);
		let mut server = ResponseServer::new(Arc::new(communication), Arc::new(queries));
		server.handle_request(PEER, Message::GetBlockHeaderAndBlock { height: 3 });
		assert_eq!(
			sent.lock().unwrap().as_slice(),
			&[Message::BlockHeader {
				header: vec![],
				witness: vec![],
				requested_height: 3
			}]
		);
	}

	#[tokio::test]
	async fn behind_sends_tip_header_only() {
		let (store, chain) = ledger(4).await;
		let (communication, sent) = recording_communication();
		let mut server = ResponseServer::new(Arc::new(communication), store);
		server.send_block_header_and_block(PEER, 8).unwrap();
		server.send_block_header_and_block(PEER, 9).unwrap();

		let tip = chain.block(4);
		let sent = sent.lock().unwrap();
		assert_eq!(sent.len(), 2);
		assert_eq!(
			sent[1],
			Message::BlockHeader {
				header: tip.data.header,
				witness: tip.witness,
				requested_height: 9
			}
		);
	}

	#[tokio::test]
	async fn known_height_sends_header_and_unfinished_block() {
		let (store, chain) = ledger(4).await;
		let (communication, sent) = recording_communication();
		let mut server = ResponseServer::new(Arc::new(communication), store);
		server.send_block_header_and_block(PEER, 2).unwrap();

		let block = chain.block(2);
		assert_eq!(
			sent.lock().unwrap().as_slice(),
			&[
				Message::BlockHeader {
					header: block.data.header.clone(),
					witness: block.witness,
					requested_height: 2
				},
				Message::UnfinishedBlock {
					header: block.data.header,
					transactions: block.data.transactions
				}
			]
		);
	}

	#[tokio::test]
	async fn missing_tip_block_is_an_error() {
		let mut queries = MockBlockQueries::new();
		queries.expect_last_block_height().return_const(5i64);
		queries
			.expect_block_at_height()
			.return_const(None::<BlockDataWithWitness>);
		let server_communication = MockCommunicationManager::new();
		let mut server = ResponseServer::new(Arc::new(server_communication), Arc::new(queries));
		let error = server.send_block_header_and_block(PEER, 7).unwrap_err();
		assert_eq!(error.to_string(), "Block at height: 5 doesn't exist.");
	}

	#[tokio::test]
	async fn complete_block_and_signature() {
		let (store, chain) = ledger(2).await;
		let (communication, sent) = recording_communication();
		let mut server = ResponseServer::new(Arc::new(communication), store);
		server.handle_request(PEER, Message::GetBlockAtHeight { height: 1 });
		server.handle_request(PEER, Message::GetBlockAtHeight { height: 3 });
		server.handle_request(
			PEER,
			Message::GetBlockSignature {
				block_rid: chain.header(1).rid(),
			},
		);
		server.handle_request(
			PEER,
			Message::GetBlockSignature {
				block_rid: BlockRid([3; 32]),
			},
		);

		let sent = sent.lock().unwrap();
		assert_eq!(sent.len(), 2);
		assert!(matches!(&sent[0], Message::CompleteBlock(block) if block.height == 1));
		assert!(matches!(
			&sent[1],
			Message::BlockSignature { signature, .. } if signature.subject_id == chain.node_ids()[0]
		));
	}

	#[tokio::test]
	async fn status_reports_next_height() {
		let (store, chain) = ledger(2).await;
		let server_communication = MockCommunicationManager::new();
		let mut server = ResponseServer::new(Arc::new(server_communication), store);
		assert_eq!(
			server.status(),
			Message::Status {
				block_rid: Some(chain.header(2).rid()),
				height: 3,
				serial: 1
			}
		);
	}
}

//! BFT witness validation of block headers.
use crate::{
	error::WitnessError,
	types::{BlockHeader, BlockRid, BlockWitness, NodeId, Signature},
};
use ed25519_compact::{KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Standard BFT quorum, `floor(2n/3) + 1` out of `n` signers.
pub fn bft_required_signatures(signers: usize) -> usize {
	signers * 2 / 3 + 1
}

/// Number of signatures required for a witness to be complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
	#[default]
	Bft,
	Fixed(usize),
}

impl Quorum {
	pub fn required(&self, signers: usize) -> usize {
		match self {
			Quorum::Bft => bft_required_signatures(signers),
			Quorum::Fixed(required) => (*required).clamp(1, signers.max(1)),
		}
	}
}

/// Accumulates verified signatures of a single block.
#[derive(Debug)]
pub struct WitnessBuilder {
	block_rid: BlockRid,
	signers: Vec<NodeId>,
	required: usize,
	signatures: BTreeMap<NodeId, Signature>,
}

impl WitnessBuilder {
	pub fn block_rid(&self) -> BlockRid {
		self.block_rid
	}

	/// Verifies the signature and records it. Repeated signatures of one signer count once.
	pub fn apply_signature(&mut self, signature: &Signature) -> Result<(), WitnessError> {
		let subject = signature.subject_id;
		if !self.signers.contains(&subject) {
			return Err(WitnessError::UnknownSigner(subject));
		}
		verify(&self.block_rid, signature)?;
		self.signatures.insert(subject, signature.clone());
		Ok(())
	}

	pub fn valid_signatures(&self) -> usize {
		self.signatures.len()
	}

	pub fn is_complete(&self) -> bool {
		self.signatures.len() >= self.required
	}

	pub fn witness(&self) -> BlockWitness {
		BlockWitness {
			block_rid: self.block_rid,
			signatures: self.signatures.values().cloned().collect(),
		}
	}
}

fn verify(block_rid: &BlockRid, signature: &Signature) -> Result<(), WitnessError> {
	let invalid = || WitnessError::InvalidSignature(signature.subject_id);
	let public_key = PublicKey::from_slice(signature.subject_id.as_bytes()).map_err(|_| invalid())?;
	let data = ed25519_compact::Signature::from_slice(&signature.data).map_err(|_| invalid())?;
	public_key
		.verify(block_rid.as_bytes(), &data)
		.map_err(|_| invalid())
}

/// Validates block witnesses against a signer set.
#[derive(Clone, Debug)]
pub struct BlockHeaderValidator {
	signers: Vec<NodeId>,
	quorum: Quorum,
}

impl BlockHeaderValidator {
	pub fn new(signers: Vec<NodeId>, quorum: Quorum) -> Self {
		BlockHeaderValidator { signers, quorum }
	}

	pub fn signers(&self) -> &[NodeId] {
		&self.signers
	}

	pub fn create_witness_builder_without_own_signature(
		&self,
		header: &BlockHeader,
	) -> WitnessBuilder {
		WitnessBuilder {
			block_rid: header.rid(),
			signers: self.signers.clone(),
			required: self.quorum.required(self.signers.len()),
			signatures: BTreeMap::new(),
		}
	}

	/// Replays every witness signature into a fresh builder.
	/// Any invalid or foreign signature rejects the witness.
	pub fn validate_witness(
		&self,
		header: &BlockHeader,
		witness: &BlockWitness,
	) -> Result<(), WitnessError> {
		let mut builder = self.create_witness_builder_without_own_signature(header);
		if witness.block_rid != builder.block_rid() {
			return Err(WitnessError::BlockMismatch {
				header: builder.block_rid(),
				witness: witness.block_rid,
			});
		}
		for signature in &witness.signatures {
			builder.apply_signature(signature)?;
		}
		if !builder.is_complete() {
			return Err(WitnessError::InsufficientSignatures {
				valid: builder.valid_signatures(),
				required: builder.required,
			});
		}
		Ok(())
	}
}

/// Signs a block as one of the signers.
pub fn sign(key_pair: &KeyPair, block_rid: &BlockRid) -> Signature {
	Signature {
		subject_id: NodeId(*key_pair.pk),
		data: key_pair.sk.sign(block_rid.as_bytes(), None).to_vec(),
	}
}

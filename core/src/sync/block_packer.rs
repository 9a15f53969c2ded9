//! Packing of consecutive blocks into a single block range response.
use crate::{messages::CompleteBlock, types::NodeId};
use codec::Encode;
use tracing::trace;

pub const MAX_BLOCKS_IN_PACKAGE: usize = 10;
pub const MAX_PACKAGE_CONTENT_BYTES: usize = 25 * 1024 * 1024;

/// Appends blocks from `start_height` up to `my_height` to `packed`, bounded by
/// [`MAX_BLOCKS_IN_PACKAGE`] and [`MAX_PACKAGE_CONTENT_BYTES`].
///
/// Returns false if a block was left out because of the byte budget.
/// A block larger than the budget is still packed when it comes first.
pub fn pack_block_range<F>(
	peer: NodeId,
	start_height: i64,
	my_height: i64,
	block_at_height: F,
	packed: &mut Vec<CompleteBlock>,
) -> bool
where
	F: Fn(i64) -> Option<CompleteBlock>,
{
	let mut total_bytes = packed.iter().map(Encode::encoded_size).sum::<usize>();
	let mut height = start_height;
	while height <= my_height && packed.len() < MAX_BLOCKS_IN_PACKAGE {
		let Some(block) = block_at_height(height) else {
			trace!(%peer, height, "Block missing, range ends");
			break;
		};
		let block_bytes = block.encoded_size();
		if total_bytes + block_bytes > MAX_PACKAGE_CONTENT_BYTES && !packed.is_empty() {
			trace!(%peer, height, total_bytes, "Block range is full");
			return false;
		}
		total_bytes += block_bytes;
		packed.push(block);
		height += 1;
	}
	true
}

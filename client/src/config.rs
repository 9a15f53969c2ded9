use ebft_sync_core::{
	sync::configuration::SyncParameters,
	types::{duration_millis_format, tracing_level_format},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::Level;

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	/// Chain identifier, 0 disables pending configuration handling (default: 1).
	pub chain_id: i64,
	/// Number of block signers, each of them serves the chain to the replica (default: 4).
	pub signers: usize,
	/// Number of additional peers serving blocks with forged witnesses (default: 1).
	pub byzantine_peers: usize,
	/// Number of blocks the signers have before the replica starts (default: 200).
	pub initial_blocks: usize,
	/// Number of blocks after which the simulation stops (default: 300).
	pub blocks: usize,
	/// Interval of block production once the replica runs (default: 100 ms).
	#[serde(with = "duration_millis_format")]
	pub block_interval: Duration,
	/// Number of transactions in each block (default: 4).
	pub transactions_per_block: usize,
	/// Size of each transaction in bytes (default: 256).
	pub transaction_size: usize,
	/// Delay of every block commit of the replica (default: 0 ms).
	#[serde(with = "duration_millis_format")]
	pub commit_delay: Duration,
	/// Interval of request handling on the serving peers (default: 10 ms).
	#[serde(with = "duration_millis_format")]
	pub serve_poll_interval: Duration,
	/// Interval of status gossip of the serving peers (default: 1000 ms).
	#[serde(with = "duration_millis_format")]
	pub status_interval: Duration,
	#[serde(flatten)]
	pub sync: SyncParameters,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			log_level: Level::INFO,
			log_format_json: false,
			chain_id: 1,
			signers: 4,
			byzantine_peers: 1,
			initial_blocks: 200,
			blocks: 300,
			block_interval: Duration::from_millis(100),
			transactions_per_block: 4,
			transaction_size: 256,
			commit_delay: Duration::ZERO,
			serve_poll_interval: Duration::from_millis(10),
			status_interval: Duration::from_secs(1),
			sync: SyncParameters {
				exit_delay: Duration::from_secs(2),
				..Default::default()
			},
		}
	}
}

impl RuntimeConfig {
	/// Height the replica has to reach
	pub fn final_height(&self) -> i64 {
		self.blocks as i64 - 1
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case(1 => 0 ; "single block")]
	#[test_case(300 => 299 ; "default")]
	fn final_height(blocks: usize) -> i64 {
		RuntimeConfig {
			blocks,
			..Default::default()
		}
		.final_height()
	}

	#[test]
	fn sync_parameters_are_flattened() {
		let config: RuntimeConfig = confy::load_path(
			std::env::temp_dir().join(format!("ebft-sync-{}.toml", uuid::Uuid::new_v4())),
		)
		.unwrap();
		assert_eq!(config.sync.exit_delay, Duration::from_secs(2));
		assert_eq!(config.sync.parallelism, 10);
	}
}

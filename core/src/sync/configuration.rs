use crate::{
	types::{duration_millis_format, millis},
	witness::Quorum,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Synchronization parameters, read only for the synchronizers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncParameters {
	/// Time after which a drained peer is asked again (default: 10000 ms)
	#[serde(with = "duration_millis_format")]
	pub resurrect_drained_time: Duration,
	/// Time after which an unresponsive peer is asked again (default: 20000 ms)
	#[serde(with = "duration_millis_format")]
	pub resurrect_unresponsive_time: Duration,
	/// Maximum number of concurrent fast sync jobs (default: 10)
	pub parallelism: usize,
	/// Fast sync is not finished before this delay elapses (default: 60000 ms)
	#[serde(with = "duration_millis_format")]
	pub exit_delay: Duration,
	/// Fast sync job without a header is considered stale after (default: 10000 ms)
	#[serde(with = "duration_millis_format")]
	pub job_timeout: Duration,
	/// Fast sync loop interval (default: 100 ms)
	#[serde(with = "duration_millis_format")]
	pub loop_interval: Duration,
	/// Number of errors within the error timeout which blacklists a peer (default: 10)
	pub max_errors_before_blacklisting: usize,
	/// Errors older than this are forgotten (default: 3600000 ms)
	#[serde(with = "duration_millis_format")]
	pub blacklisting_error_timeout: Duration,
	/// Duration of a blacklisting (default: 600000 ms)
	#[serde(with = "duration_millis_format")]
	pub blacklisting_timeout: Duration,
	/// Fast sync continues at least until this height is reached (default: -1)
	pub must_sync_until_height: i64,
	/// Stale sweeps a potentially legacy peer gets before it is marked unresponsive (default: 1)
	pub legacy_grace_cycles: usize,
	/// Slow sync waits this long for a block range reply (default: 15000 ms)
	#[serde(with = "duration_millis_format")]
	pub slow_sync_max_peer_wait_time: Duration,
	/// Lower bound of the slow sync poll interval (default: 20 ms)
	#[serde(with = "duration_millis_format")]
	pub slow_sync_min_sleep: Duration,
	/// Upper bound of the slow sync poll interval (default: 10000 ms)
	#[serde(with = "duration_millis_format")]
	pub slow_sync_max_sleep: Duration,
	/// Longest nap of the slow sync loop between message checks (default: 100 ms)
	#[serde(with = "duration_millis_format")]
	pub slow_sync_max_nap: Duration,
	/// Block rate the slow sync poll interval is tuned towards (default: 10.0)
	pub slow_sync_ideal_blocks_per_second: f64,
	/// Number of responses the block rate is measured over (default: 10)
	pub slow_sync_sleep_window: usize,
	/// Longest wait for outstanding commits before a block range is dropped (default: 10000 ms)
	#[serde(with = "duration_millis_format")]
	pub slow_sync_commit_wait_timeout: Duration,
	/// Number of witness signatures required (default: bft)
	pub quorum: Quorum,
}

impl Default for SyncParameters {
	fn default() -> Self {
		SyncParameters {
			resurrect_drained_time: Duration::from_secs(10),
			resurrect_unresponsive_time: Duration::from_secs(20),
			parallelism: 10,
			exit_delay: Duration::from_secs(60),
			job_timeout: Duration::from_secs(10),
			loop_interval: Duration::from_millis(100),
			max_errors_before_blacklisting: 10,
			blacklisting_error_timeout: Duration::from_secs(3600),
			blacklisting_timeout: Duration::from_secs(600),
			must_sync_until_height: -1,
			legacy_grace_cycles: 1,
			slow_sync_max_peer_wait_time: Duration::from_secs(15),
			slow_sync_min_sleep: Duration::from_millis(20),
			slow_sync_max_sleep: Duration::from_secs(10),
			slow_sync_max_nap: Duration::from_millis(100),
			slow_sync_ideal_blocks_per_second: 10.0,
			slow_sync_sleep_window: 10,
			slow_sync_commit_wait_timeout: Duration::from_secs(10),
			quorum: Quorum::Bft,
		}
	}
}

impl SyncParameters {
	pub fn resurrect_drained_millis(&self) -> i64 {
		millis(self.resurrect_drained_time)
	}

	pub fn resurrect_unresponsive_millis(&self) -> i64 {
		millis(self.resurrect_unresponsive_time)
	}

	pub fn blacklisting_error_timeout_millis(&self) -> i64 {
		millis(self.blacklisting_error_timeout)
	}

	pub fn blacklisting_timeout_millis(&self) -> i64 {
		millis(self.blacklisting_timeout)
	}
}

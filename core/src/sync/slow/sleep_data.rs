use crate::{
	sync::configuration::SyncParameters,
	types::{millis, Timestamp},
};
use std::{collections::VecDeque, time::Duration};
use tracing::trace;

const MIN_FACTOR: f64 = 0.5;
const MAX_FACTOR: f64 = 2.0;

#[derive(Clone, Copy, Debug)]
struct Response {
	at: Timestamp,
	accepted_blocks: usize,
}

/// Throughput of the last block range responses, driving the poll interval of slow sync.
#[derive(Debug)]
pub struct SlowSyncSleepData {
	current_sleep: Duration,
	min_sleep: Duration,
	max_sleep: Duration,
	ideal_blocks_per_second: f64,
	window: usize,
	responses: VecDeque<Response>,
}

impl SlowSyncSleepData {
	pub fn new(parameters: &SyncParameters) -> Self {
		SlowSyncSleepData {
			current_sleep: parameters.slow_sync_min_sleep,
			min_sleep: parameters.slow_sync_min_sleep,
			max_sleep: parameters.slow_sync_max_sleep,
			ideal_blocks_per_second: parameters.slow_sync_ideal_blocks_per_second,
			window: parameters.slow_sync_sleep_window.max(2),
			responses: VecDeque::new(),
		}
	}

	pub fn current_sleep(&self) -> Duration {
		self.current_sleep
	}

	pub fn current_sleep_millis(&self) -> i64 {
		millis(self.current_sleep)
	}

	/// Records a handled response and recalculates the sleep.
	pub fn update_data(&mut self, now: Timestamp, accepted_blocks: usize) {
		self.responses.push_back(Response {
			at: now,
			accepted_blocks,
		});
		while self.responses.len() > self.window {
			self.responses.pop_front();
		}
		if let Some(rate) = self.achieved_rate() {
			self.current_sleep = self.calculate_sleep(rate / self.ideal_blocks_per_second);
			trace!(
				rate,
				sleep = ?self.current_sleep,
				"Slow sync sleep updated"
			);
		}
	}

	/// Blocks per second over the window. Blocks of the first response arrived
	/// before the measured interval started.
	fn achieved_rate(&self) -> Option<f64> {
		let first = self.responses.front()?;
		let last = self.responses.back()?;
		let elapsed = last.at - first.at;
		if self.responses.len() < 2 || elapsed <= 0 {
			return None;
		}
		let blocks: usize = self
			.responses
			.iter()
			.skip(1)
			.map(|response| response.accepted_blocks)
			.sum();
		Some(blocks as f64 * 1000.0 / elapsed as f64)
	}

	/// Scales the sleep by the fourth root of the throughput ratio, bounded to halving or doubling.
	pub fn calculate_sleep(&self, ratio: f64) -> Duration {
		let factor = ratio.powf(0.25).clamp(MIN_FACTOR, MAX_FACTOR);
		self.current_sleep
			.mul_f64(factor)
			.clamp(self.min_sleep, self.max_sleep)
	}
}

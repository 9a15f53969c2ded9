use std::{
	future::Future,
	mem,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
	task::Waker,
};

use self::{completed::Completed, signal::Signal};

mod completed;
mod signal;
mod utils;

#[derive(Clone)]
/// Shutdown controller for graceful shutdowns in async code.
///
/// Triggering the shutdown resolves every [`Signal`] and cancels futures wrapped with
/// [`Controller::with_cancel`]. The shutdown completes once every [`DelayToken`] is dropped,
/// which lets in-flight block commits finish before the process exits.
///
/// The Controller can be cloned and is thread-safe.
pub struct Controller<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

fn lock<T>(inner: &Mutex<ControllerInner<T>>) -> MutexGuard<'_, ControllerInner<T>> {
	inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Clone> Controller<T> {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(Mutex::new(ControllerInner::new())),
		}
	}

	pub fn is_shutdown_triggered(&self) -> bool {
		lock(&self.inner).reason.is_some()
	}

	pub fn is_shutdown_completed(&self) -> bool {
		let inner = lock(&self.inner);
		inner.reason.is_some() && inner.delay_tokens == 0
	}

	/// Returns [`None`] if the shutdown has not been triggered yet.
	pub fn shutdown_reason(&self) -> Option<T> {
		lock(&self.inner).reason.clone()
	}

	/// Triggers the shutdown to begin.
	///
	/// If the shutdown has already been started, this function returns an error.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		lock(&self.inner).shutdown(reason)
	}

	/// Future that resolves when the shutdown is triggered and all delay tokens are dropped.
	pub fn completed_shutdown(&self) -> Completed<T> {
		Completed {
			inner: self.inner.clone(),
		}
	}

	/// Future that resolves with the reason once the shutdown is triggered.
	pub fn triggered_shutdown(&self) -> Signal<T> {
		Signal {
			inner: self.inner.clone(),
		}
	}

	/// Wraps a future to cancel it upon a triggered shutdown.
	///
	/// Completes with `Err(reason)` if the shutdown is triggered before the wrapped future.
	pub fn with_cancel<F: Future>(&self, future: F) -> impl Future<Output = Result<F::Output, T>> {
		self.triggered_shutdown().with_cancel(future)
	}

	/// Wraps a future to defer shutdown completion until the wrapped future completes or is dropped.
	pub fn with_delay<F: Future>(
		&self,
		future: F,
	) -> Result<impl Future<Output = F::Output>, ShutdownHasCompleted<T>> {
		Ok(self.delay_token()?.with_future(future))
	}

	/// Produces a token that delays the shutdown completion as long as it exists.
	///
	/// If the shutdown has already completed, this function returns an error.
	pub fn delay_token(&self) -> Result<DelayToken<T>, ShutdownHasCompleted<T>> {
		let mut inner = lock(&self.inner);
		if inner.delay_tokens == 0 {
			if let Some(reason) = &inner.reason {
				return Err(ShutdownHasCompleted::new(reason.clone()));
			}
		}

		inner.delay_tokens += 1;
		Ok(DelayToken {
			inner: self.inner.clone(),
		})
	}

	/// Triggers the shutdown on termination signals (Ctrl-C, SIGTERM).
	pub async fn on_user_signal(&self, user_signal_reason: T) {
		utils::user_signal().await;
		let _ = self.trigger_shutdown(user_signal_reason);
	}
}

impl<T: Clone> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}

pub struct ControllerInner<T> {
	/// The reason why shutdown is happening.
	reason: Option<T>,

	/// Count of all delay tokens in existence, must reach 0 before shutdown can complete.
	delay_tokens: usize,

	/// Tasks that need to be awaken when shutdown is triggered.
	on_shutdown_trigger: Vec<Waker>,

	/// Tasks that need to be awaken when the shutdown is complete.
	on_shutdown_complete: Vec<Waker>,
}

impl<T: Clone> ControllerInner<T> {
	fn new() -> Self {
		Self {
			reason: None,
			delay_tokens: 0,
			on_shutdown_trigger: Vec::new(),
			on_shutdown_complete: Vec::new(),
		}
	}

	fn decrement_delay_tokens(&mut self) {
		self.delay_tokens = self.delay_tokens.saturating_sub(1);
		if self.delay_tokens == 0 {
			self.notify_shutdown_complete();
		}
	}

	fn notify_shutdown_complete(&mut self) {
		for waker in mem::take(&mut self.on_shutdown_complete) {
			waker.wake()
		}
	}

	fn shutdown(&mut self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		match &self.reason {
			Some(original) => Err(ShutdownHasStarted::new(original.clone(), reason)),
			None => {
				self.reason = Some(reason);
				for waker in mem::take(&mut self.on_shutdown_trigger) {
					waker.wake()
				}
				if self.delay_tokens == 0 {
					self.notify_shutdown_complete()
				}
				Ok(())
			},
		}
	}
}

/// The shutdown completion is delayed as long as this token exists.
///
/// For shutdown to complete, all clones must be dropped.
pub struct DelayToken<T: Clone> {
	inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> DelayToken<T> {
	/// Consumes the token, holding it until the wrapped future resolves or is dropped.
	pub fn with_future<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
		async move {
			let output = future.await;
			drop(self);
			output
		}
	}
}

impl<T: Clone> Clone for DelayToken<T> {
	fn clone(&self) -> Self {
		lock(&self.inner).delay_tokens += 1;
		DelayToken {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Clone> Drop for DelayToken<T> {
	fn drop(&mut self) {
		lock(&self.inner).decrement_delay_tokens();
	}
}

/// Returned when the shutdown is triggered more than once.
#[derive(Debug, Clone)]
pub struct ShutdownHasStarted<T> {
	/// The shutdown reason of the already started shutdown.
	pub reason: T,

	/// The provided reason that was ignored.
	pub ignored: T,
}

impl<T> ShutdownHasStarted<T> {
	pub const fn new(reason: T, ignored: T) -> Self {
		Self { reason, ignored }
	}
}

impl<T: std::fmt::Debug> std::error::Error for ShutdownHasStarted<T> {}

impl<T> std::fmt::Display for ShutdownHasStarted<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "shutdown has already commenced")
	}
}

/// Returned when trying to delay a shutdown that has already been completed.
#[derive(Debug)]
pub struct ShutdownHasCompleted<T> {
	pub reason: T,
}

impl<T> ShutdownHasCompleted<T> {
	pub const fn new(reason: T) -> Self {
		Self { reason }
	}
}

impl<T: std::fmt::Debug> std::error::Error for ShutdownHasCompleted<T> {}

impl<T> std::fmt::Display for ShutdownHasCompleted<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "shutdown has been completed, can not delay any further")
	}
}

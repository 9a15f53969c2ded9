use std::{
	future::Future,
	pin::Pin,
	sync::{Arc, Mutex},
	task::{Context, Poll},
};

use super::{lock, ControllerInner};

/// Future which resolves with the shutdown reason once the shutdown is triggered.
#[derive(Clone)]
pub struct Signal<T: Clone> {
	pub(super) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Signal<T> {
	/// Runs the future until it completes or the shutdown is triggered.
	pub fn with_cancel<F: Future>(self, future: F) -> impl Future<Output = Result<F::Output, T>> {
		async move {
			tokio::select! {
				biased;
				reason = self => Err(reason),
				output = future => Ok(output),
			}
		}
	}
}

impl<T: Clone> Future for Signal<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = lock(&self.inner);
		if let Some(reason) = inner.reason.clone() {
			return Poll::Ready(reason);
		}
		inner.on_shutdown_trigger.push(cx.waker().clone());
		Poll::Pending
	}
}

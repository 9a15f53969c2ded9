use std::future::Future;
use std::pin::Pin;
use std::{
	sync::{Arc, Mutex},
	task::{Context, Poll},
};

use super::{lock, ControllerInner};

/// Completes when a shutdown reason is set and all delay tokens have been dropped.
pub struct Completed<T: Clone> {
	pub(super) inner: Arc<Mutex<ControllerInner<T>>>,
}

impl<T: Clone> Future for Completed<T> {
	type Output = T;

	fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		let mut inner = lock(&self.inner);
		if let (0, Some(reason)) = (inner.delay_tokens, inner.reason.as_ref()) {
			return Poll::Ready(reason.clone());
		}

		// always clone waker, so we don't end-up with staled ones
		inner.on_shutdown_complete.push(cx.waker().clone());
		Poll::Pending
	}
}

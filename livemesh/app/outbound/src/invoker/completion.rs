use crate::errors::RetryAbandoned;
use parking_lot::Mutex;
use pin_project::pin_project;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::sync::oneshot;

/// The sending half of a detached call's result. The first completion wins;
/// later ones are discarded.
#[derive(Debug)]
pub struct Completion<R> {
    tx: Mutex<Option<oneshot::Sender<R>>>,
    attempts: Arc<AtomicU32>,
}

/// Resolves with the result of a detached call, or with [`RetryAbandoned`]
/// if the call was dropped before it completed.
#[pin_project]
#[derive(Debug)]
pub struct ResponseFuture<R> {
    #[pin]
    rx: oneshot::Receiver<R>,
    attempts: Arc<AtomicU32>,
}

/// Creates a completion for a call that has made `attempts` attempts so far.
pub(crate) fn channel<R>(attempts: u32) -> (Completion<R>, ResponseFuture<R>) {
    let (tx, rx) = oneshot::channel();
    let attempts = Arc::new(AtomicU32::new(attempts));
    let completion = Completion {
        tx: Mutex::new(Some(tx)),
        attempts: attempts.clone(),
    };
    (completion, ResponseFuture { rx, attempts })
}

// === impl Completion ===

impl<R> Completion<R> {
    /// Records that another attempt was made.
    pub fn attempted(&self, attempt: u32) {
        self.attempts.fetch_max(attempt + 1, Ordering::Release);
    }

    /// Completes the call. Returns false if it was already complete or its
    /// caller went away.
    pub fn complete(&self, rsp: R) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            tracing::debug!("Call already completed");
            return false;
        };
        tx.send(rsp).is_ok()
    }

    pub fn is_complete(&self) -> bool {
        self.tx.lock().is_none()
    }
}

// === impl ResponseFuture ===

impl<R> Future for ResponseFuture<R> {
    type Output = Result<R, RetryAbandoned>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match futures::ready!(this.rx.poll(cx)) {
            Ok(rsp) => Poll::Ready(Ok(rsp)),
            Err(_) => Poll::Ready(Err(RetryAbandoned {
                attempts: this.attempts.load(Ordering::Acquire),
            })),
        }
    }
}

//! FIFO queue of calls that failed with [`Error::Disconnected`].
//!
//! A queued call keeps its original caller waiting on a oneshot. After the
//! client reconnects it drains the queue in order and resolves each caller
//! with the outcome of the re-submitted request, so per-chat send order is
//! preserved across a drop.
//!
//! While a replay is running the queue is *gated*: new queueable calls are
//! parked behind the ones being replayed instead of going straight to the
//! fresh socket. The gate only opens once a drain comes back empty.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::protocol::{ChatId, KeyVersion, Request};

/// Outcome of a replayed call.
pub type CallResult = Result<serde_json::Value>;

/// What to do when the call is replayed.
#[cfg_attr(test, derive(Debug))]
pub enum QueuedWork {
    /// Resend as is.
    Request(Request),
    /// A text message whose chat key could not be fetched. It is encrypted
    /// when replayed.
    Text {
        chat_id: ChatId,
        version: KeyVersion,
        text: Zeroizing<String>,
    },
}

impl QueuedWork {
    pub fn op_name(&self) -> &'static str {
        match self {
            QueuedWork::Request(request) => request.op_name(),
            QueuedWork::Text { .. } => "send_message",
        }
    }
}

pub struct QueuedCall {
    pub work: QueuedWork,
    responder: oneshot::Sender<CallResult>,
}

impl QueuedCall {
    /// Hand the outcome to the waiting caller. A caller that gave up is
    /// ignored.
    pub fn resolve(self, result: CallResult) {
        let _ = self.responder.send(result);
    }
}

#[derive(Default)]
struct Inner {
    calls: VecDeque<QueuedCall>,
    replaying: bool,
}

#[derive(Default)]
pub struct RetryQueue {
    inner: Mutex<Inner>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue work and return the receiver its caller should await.
    pub fn push(&self, work: QueuedWork) -> oneshot::Receiver<CallResult> {
        let mut inner = self.inner.lock();
        Self::push_locked(&mut inner, work)
    }

    /// Queue `work` if a replay is running or `stale()` holds, checked under
    /// the queue lock. Otherwise hand `work` back.
    pub fn push_if(
        &self,
        work: QueuedWork,
        stale: impl FnOnce() -> bool,
    ) -> std::result::Result<oneshot::Receiver<CallResult>, QueuedWork> {
        let mut inner = self.inner.lock();
        if inner.replaying || stale() {
            Ok(Self::push_locked(&mut inner, work))
        } else {
            Err(work)
        }
    }

    fn push_locked(inner: &mut Inner, work: QueuedWork) -> oneshot::Receiver<CallResult> {
        let (responder, rx) = oneshot::channel();
        tracing::debug!(op = work.op_name(), "Queueing call for retry");
        inner.calls.push_back(QueuedCall { work, responder });
        rx
    }

    /// Close the gate: queueable calls wait until [`Self::next_batch`]
    /// comes back empty or [`Self::abort_replay`] is called.
    pub fn begin_replay(&self) {
        self.inner.lock().replaying = true;
    }

    /// Take every queued call, oldest first. An empty batch opens the gate.
    pub fn next_batch(&self) -> Vec<QueuedCall> {
        let mut inner = self.inner.lock();
        if inner.calls.is_empty() {
            inner.replaying = false;
        }
        inner.calls.drain(..).collect()
    }

    /// Open the gate, leaving queued calls for the next replay.
    pub fn abort_replay(&self) {
        self.inner.lock().replaying = false;
    }

    pub fn is_replaying(&self) -> bool {
        self.inner.lock().replaying
    }

    /// Put calls that could not be replayed back at the head, keeping their
    /// order ahead of anything queued since.
    pub fn requeue_front(&self, calls: Vec<QueuedCall>) {
        let mut inner = self.inner.lock();
        for call in calls.into_iter().rev() {
            inner.calls.push_front(call);
        }
    }

    /// Fail every queued call, e.g. when the client shuts down.
    pub fn fail_all(&self, error: Error) {
        let calls: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.replaying = false;
            inner.calls.drain(..).collect()
        };
        for call in calls {
            call.resolve(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().calls.is_empty()
    }
}

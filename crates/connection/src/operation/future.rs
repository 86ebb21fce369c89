//! Caller side of an operation.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::queue::SegQueue;
use tokio::sync::{oneshot, Notify};

use super::Operation;
use crate::error::{CancelCause, ConnectionError, Result};

/// Operations whose callers gave up waiting, reported to the engine thread
/// so it can account the timeout against the handling node.
pub(crate) struct TimeoutNotices {
    queue: SegQueue<Arc<Operation>>,
    wakeup: Arc<Notify>,
}

impl TimeoutNotices {
    pub(crate) fn new(wakeup: Arc<Notify>) -> Self {
        Self {
            queue: SegQueue::new(),
            wakeup,
        }
    }

    fn post(&self, op: Arc<Operation>) {
        self.queue.push(op);
        self.wakeup.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<Arc<Operation>> {
        self.queue.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Resolves to the response frame of a submitted operation.
///
/// Waiting is bounded: when the deadline passes the operation is cancelled
/// and the call returns [`ConnectionError::TimedOut`]. A response that arrives
/// for a timed-out operation is discarded by the engine.
#[must_use = "an operation future does nothing unless awaited"]
pub struct OperationFuture {
    op: Arc<Operation>,
    rx: oneshot::Receiver<Result<Bytes>>,
    notices: Arc<TimeoutNotices>,
    default_timeout: Duration,
}

impl OperationFuture {
    pub(crate) fn new(
        op: Arc<Operation>,
        rx: oneshot::Receiver<Result<Bytes>>,
        notices: Arc<TimeoutNotices>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            op,
            rx,
            notices,
            default_timeout,
        }
    }

    /// Wait with the configured operation timeout.
    pub async fn get(self) -> Result<Bytes> {
        let timeout = self.default_timeout;
        self.get_timeout(timeout).await
    }

    pub async fn get_timeout(mut self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // The engine dropped the operation without an answer.
            Ok(Err(_)) => Err(ConnectionError::Shutdown),
            Err(_) => {
                let cancelled = self.op.cancel_leaves(CancelCause::TimedOut);
                if !cancelled {
                    if let Ok(result) = self.rx.try_recv() {
                        return result;
                    }
                }
                self.notices.post(Arc::clone(&self.op));
                Err(ConnectionError::TimedOut { elapsed: timeout })
            }
        }
    }

    /// Cancel explicitly. Returns `false` if the operation already finished.
    pub fn cancel(&self) -> bool {
        self.op.cancel_leaves(CancelCause::Explicit)
    }

    pub fn operation(&self) -> &Arc<Operation> {
        &self.op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::tests::LineRequest;
    use crate::operation::OpState;
    use corelib::NodeId;

    fn future_for(op: Arc<Operation>, rx: oneshot::Receiver<Result<Bytes>>) -> (OperationFuture, Arc<TimeoutNotices>) {
        let notices = Arc::new(TimeoutNotices::new(Arc::new(Notify::new())));
        let future = OperationFuture::new(op, rx, Arc::clone(&notices), Duration::from_millis(20));
        (future, notices)
    }

    #[tokio::test]
    async fn test_completed_result_is_returned() {
        let (op, rx) = Operation::new(LineRequest::boxed(&["a"]));
        let (future, _) = future_for(Arc::clone(&op), rx);
        op.complete(Bytes::from_static(b"v"));

        assert_eq!(future.get().await.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_posts_notice() {
        let (op, rx) = Operation::new(LineRequest::boxed(&["a"]));
        let (future, notices) = future_for(Arc::clone(&op), rx);

        let err = future.get().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(op.state(), OpState::Cancelled);
        assert_eq!(op.cancel_cause(), Some(CancelCause::TimedOut));
        assert!(notices.pop().is_some());
    }

    #[tokio::test]
    async fn test_timeout_after_reroute_reaches_the_copy() {
        let (op, rx) = Operation::new(LineRequest::boxed(&["a"]));
        let (future, notices) = future_for(Arc::clone(&op), rx);
        op.set_handling_node(Some(NodeId::from_name("old:1")));

        let completion = op.supersede().unwrap();
        let copy = Operation::derived(LineRequest::boxed(&["a"]), completion, 0);
        copy.set_handling_node(Some(NodeId::from_name("new:1")));
        op.set_successors(vec![Arc::clone(&copy)]);

        assert!(future.get().await.unwrap_err().is_timeout());
        assert_eq!(copy.cancel_cause(), Some(CancelCause::TimedOut));
        assert_eq!(op.cancel_cause(), Some(CancelCause::Superseded));

        let noticed = notices.pop().unwrap();
        let charged: Vec<_> = noticed.leaves().iter().map(|o| o.handling_node()).collect();
        assert_eq!(charged, vec![Some(NodeId::from_name("new:1"))]);
    }

    #[tokio::test]
    async fn test_explicit_cancel() {
        let (op, rx) = Operation::new(LineRequest::boxed(&["a"]));
        let (future, _) = future_for(op, rx);

        assert!(future.cancel());
        assert!(!future.cancel());
        assert!(future.get().await.unwrap_err().is_cancelled());
    }
}

use std::time::Duration;
use tokio::sync::oneshot;
use crate::error::{Error, Result};
use crate::util::with_timeout;

/// Slot that waits for exactly one reply from the server.
///
/// The slot is resolved at most once: the first result wins and later results are dropped.
#[derive(Debug)]
pub(super) struct PendingSlot<T> {
    result_tx: Option<oneshot::Sender<Result<T>>>,
}

/// The waiting half of a [`PendingSlot`].
#[derive(Debug)]
pub(super) struct PendingReply<T> {
    result_rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingSlot<T> {
    pub fn new() -> (PendingSlot<T>, PendingReply<T>) {
        let (result_tx, result_rx) = oneshot::channel();
        (PendingSlot { result_tx: Some(result_tx) }, PendingReply { result_rx })
    }

    /// Resolves the slot, returns false if it has already been resolved.
    ///
    /// A waiter that gave up (timed out or was dropped) does not count as resolved: the slot still
    /// consumes its reply, which keeps FIFO matching of replies intact.
    pub fn resolve(&mut self, result: Result<T>) -> bool {
        match self.result_tx.take() {
            Some(result_tx) => {
                let _ = result_tx.send(result);
                true
            },
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result_tx.is_none()
    }

    /// True if the waiting half has been dropped.
    pub fn is_abandoned(&self) -> bool {
        match self.result_tx.as_ref() {
            Some(result_tx) => result_tx.is_closed(),
            None => false,
        }
    }
}

impl<T> PendingReply<T> {
    /// Waits for the reply, at most for `timeout`.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<T> {
        with_timeout(timeout, async move {
            self.result_rx.await.map_err(|_| Error::SessionClosed)?
        }).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use super::*;

    #[tokio::test]
    async fn test_resolve_once() {
        let (mut slot, reply) = PendingSlot::<u32>::new();
        assert!(!slot.is_resolved());
        assert!(slot.resolve(Ok(1)));
        assert!(slot.is_resolved());
        assert!(!slot.resolve(Ok(2)));
        assert!(!slot.resolve(Err(Error::ChannelReq)));
        assert_eq!(reply.wait(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resolve_error() {
        let (mut slot, reply) = PendingSlot::<()>::new();
        slot.resolve(Err(Error::SessionFailed(Arc::new(Error::Mac))));
        match reply.wait(None).await {
            Err(Error::SessionFailed(err)) => assert!(matches!(*err, Error::Mac)),
            res => panic!("unexpected result {:?}", res),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let (mut slot, reply) = PendingSlot::<()>::new();
        let res = reply.wait(Some(Duration::from_millis(10))).await;
        assert!(matches!(res, Err(Error::Timeout)));
        // the reply still consumes the slot after the waiter gave up
        assert!(slot.resolve(Ok(())));
    }

    #[tokio::test]
    async fn test_dropped_slot() {
        let (slot, reply) = PendingSlot::<()>::new();
        drop(slot);
        assert!(matches!(reply.wait(None).await, Err(Error::SessionClosed)));
    }
}

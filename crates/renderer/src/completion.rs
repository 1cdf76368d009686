//! One-shot completion handles fulfilled by the render thread.
//!
//! A [`Completer`] is consumed by resolving or rejecting it, so each request
//! settles at most once. Dropping an unsettled completer settles the paired
//! [`Completion`] with the error type's [`Canceled`] conversion, which keeps
//! callers from blocking forever on work the render thread discarded.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

/// The completing side went away without producing a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Canceled;

/// Creates a linked completer/completion pair.
pub fn channel<T, E>() -> (Completer<T, E>, Completion<T, E>) {
    let (sender, receiver) = bounded(1);
    (Completer { sender }, Completion { receiver })
}

/// Producer half, owned by whoever performs the work.
#[derive(Debug)]
pub struct Completer<T, E> {
    sender: Sender<Result<T, E>>,
}

impl<T, E> Completer<T, E> {
    pub fn resolve(self, value: T) {
        self.complete(Ok(value));
    }

    pub fn reject(self, error: E) {
        self.complete(Err(error));
    }

    pub fn complete(self, result: Result<T, E>) {
        // The caller may have stopped waiting; that is not our concern.
        let _ = self.sender.send(result);
    }
}

/// Consumer half handed back to the caller.
#[derive(Debug)]
pub struct Completion<T, E> {
    receiver: Receiver<Result<T, E>>,
}

impl<T, E: From<Canceled>> Completion<T, E> {
    /// Blocks until the request settles.
    pub fn wait(self) -> Result<T, E> {
        self.receiver.recv().unwrap_or_else(|_| Err(E::from(Canceled)))
    }

    /// Blocks for at most `timeout`; `None` means the request is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(E::from(Canceled))),
        }
    }

    /// Returns the result if it is already available.
    pub fn try_wait(&self) -> Option<Result<T, E>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(E::from(Canceled))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed,
        Canceled,
    }

    impl From<Canceled> for TestError {
        fn from(_: Canceled) -> Self {
            TestError::Canceled
        }
    }

    #[test]
    fn resolved_value_reaches_waiter() {
        let (completer, completion) = channel::<u32, TestError>();
        completer.resolve(7);
        assert_eq!(completion.wait(), Ok(7));
    }

    #[test]
    fn rejection_reaches_waiter_across_threads() {
        let (completer, completion) = channel::<(), TestError>();
        let worker = std::thread::spawn(move || completer.reject(TestError::Failed));
        assert_eq!(completion.wait(), Err(TestError::Failed));
        worker.join().unwrap();
    }

    #[test]
    fn dropped_completer_cancels() {
        let (completer, completion) = channel::<(), TestError>();
        assert!(completion.try_wait().is_none());
        drop(completer);
        assert_eq!(completion.try_wait(), Some(Err(TestError::Canceled)));
    }

    #[test]
    fn pending_request_times_out() {
        let (_completer, completion) = channel::<(), TestError>();
        assert!(completion
            .wait_timeout(Duration::from_millis(10))
            .is_none());
    }
}

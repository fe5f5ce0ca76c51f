// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! One-shot rendezvous between a waiting caller and the event dispatcher.
//!
//! A [`Completion`] is settled at most once, by value. Dropping it without
//! settling wakes the [`Waiter`] with [`WaitError::Abandoned`].

use std::time::Duration;

use tokio::sync::oneshot;

/// Creates a linked completion/waiter pair.
pub(crate) fn completion<T>() -> (Completion<T>, Waiter<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, Waiter { rx })
}

/// Settling half. Owned by whoever observes the outcome.
#[derive(Debug)]
pub(crate) struct Completion<T> {
    tx: oneshot::Sender<T>,
}

impl<T> Completion<T> {
    /// Delivers `value`. Returns `false` if the waiter has gone away.
    pub(crate) fn settle(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    /// Returns `true` if the waiter was dropped or timed out.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Waiting half.
#[derive(Debug)]
pub(crate) struct Waiter<T> {
    rx: oneshot::Receiver<T>,
}

/// Why a wait ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The completion was dropped unsettled.
    Abandoned,
    /// The deadline passed first.
    Elapsed,
}

impl<T> Waiter<T> {
    /// Waits until settled or abandoned.
    pub(crate) async fn wait(self) -> Result<T, WaitError> {
        self.rx.await.map_err(|_| WaitError::Abandoned)
    }

    /// Waits at most `timeout`.
    pub(crate) async fn wait_timeout(self, timeout: Duration) -> Result<T, WaitError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(WaitError::Abandoned),
            Err(_) => Err(WaitError::Elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settle_wakes_waiter() {
        let (done, waiter) = completion();
        assert!(done.settle(7u32));
        assert_eq!(waiter.wait().await, Ok(7));
    }

    #[tokio::test]
    async fn test_drop_abandons() {
        let (done, waiter) = completion::<u32>();
        drop(done);
        assert_eq!(waiter.wait().await, Err(WaitError::Abandoned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapses() {
        let (done, waiter) = completion::<u32>();
        let result = waiter.wait_timeout(Duration::from_millis(50)).await;
        assert_eq!(result, Err(WaitError::Elapsed));
        assert!(done.is_abandoned());
        assert!(!done.settle(1));
    }

    #[tokio::test]
    async fn test_settle_from_other_thread() {
        let (done, waiter) = completion();
        std::thread::spawn(move || {
            done.settle("ok");
        });
        assert_eq!(waiter.wait_timeout(Duration::from_secs(5)).await, Ok("ok"));
    }
}

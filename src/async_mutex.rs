//! C3: an async mutex whose only state is a single-slot channel carrying the
//! protected value itself.
//!
//! The original `basic_async_channel<Tp...>` passes a tuple of values through
//! a single-slot queue and calls the act of taking that slot "locking"; its
//! `basic_async_mutex` is just that channel instantiated with an empty tuple,
//! i.e. a bare token. This generalizes the same idea the other direction:
//! instead of a unit token guarding access to some resource that lives
//! elsewhere, the slot *is* the resource. Acquiring the lock takes the value
//! out of the channel; dropping the guard puts it back. A
//! `tokio::sync::Mutex` around the receiver only arbitrates which concurrent
//! `lock().await` caller gets to poll the channel next — it never guards the
//! protected value itself, so it is held only across a channel recv, never
//! across a caller's critical section.

use std::ops::{Deref, DerefMut};

use tokio::sync::{mpsc, Mutex as StdAsyncMutex};

/// An async mutex guarding a value of type `T`.
pub struct AsyncMutex<T> {
    receiver: StdAsyncMutex<mpsc::Receiver<T>>,
    sender: mpsc::Sender<T>,
}

impl<T: Send + 'static> AsyncMutex<T> {
    pub fn new(value: T) -> Self {
        let (sender, receiver) = mpsc::channel(1);
        // The channel starts empty; seed it with the one slot it will ever hold.
        sender
            .try_send(value)
            .unwrap_or_else(|_| unreachable!("fresh channel with capacity 1 cannot be full"));
        Self {
            receiver: StdAsyncMutex::new(receiver),
            sender,
        }
    }

    /// Acquire the lock, waiting for any other holder to release it.
    pub async fn lock(&self) -> AsyncMutexGuard<'_, T> {
        let mut receiver = self.receiver.lock().await;
        let value = receiver
            .recv()
            .await
            .expect("AsyncMutex sender half dropped while receiver is held locally");
        drop(receiver);
        AsyncMutexGuard {
            mutex: self,
            value: Some(value),
        }
    }

    /// Acquire the lock only if it is immediately available.
    pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_, T>> {
        let mut receiver = match self.receiver.try_lock() {
            Ok(r) => r,
            Err(_) => return None,
        };
        match receiver.try_recv() {
            Ok(value) => Some(AsyncMutexGuard {
                mutex: self,
                value: Some(value),
            }),
            Err(_) => None,
        }
    }
}

/// An RAII guard granting exclusive access to the value held by an
/// [`AsyncMutex`]. The value is returned to the channel when the guard drops.
pub struct AsyncMutexGuard<'a, T: Send + 'static> {
    mutex: &'a AsyncMutex<T>,
    value: Option<T>,
}

impl<T: Send + 'static> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("value taken before drop")
    }
}

impl<T: Send + 'static> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value taken before drop")
    }
}

impl<T: Send + 'static> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            // The channel has capacity 1 and we are the only holder of the
            // single permit, so this can never block or fail.
            if self.mutex.sender.try_send(value).is_err() {
                unreachable!("AsyncMutex slot double-filled: lock discipline violated");
            }
        }
    }
}

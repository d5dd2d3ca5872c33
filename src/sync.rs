use std::pin::pin;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;

/// A mutex-guarded value paired with a change notification.
///
/// Waiters never assume that a wakeup means their condition holds:
/// [`Watch::wait_for`] re-evaluates its predicate under the lock after every
/// notification, so spurious wakeups and multiple waiters are harmless.
pub(crate) struct Watch<T> {
    value: Mutex<T>,
    changed: Notify,
}

impl<T> Watch<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Notify::new(),
        }
    }

    /// Locks the value without waking anyone on release.
    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock()
    }

    /// Mutates the value and wakes every waiter.
    pub(crate) fn send_modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let r = f(&mut self.value.lock());
        self.changed.notify_waiters();
        r
    }

    /// Wakes every waiter so they re-check state that lives outside the value.
    #[inline]
    pub(crate) fn notify(&self) {
        self.changed.notify_waiters();
    }

    /// Waits until `f` returns `Some`. `f` runs with the lock held and may
    /// mutate the value; the lock is never held across a suspension point.
    pub(crate) async fn wait_for<R>(&self, mut f: impl FnMut(&mut T) -> Option<R>) -> R {
        loop {
            let mut notified = pin!(self.changed.notified());
            // Register before checking, so a change between the check and the
            // await still wakes us.
            notified.as_mut().enable();
            let ready = {
                let mut value = self.value.lock();
                f(&mut value)
            };
            if let Some(r) = ready {
                return r;
            }
            notified.await;
        }
    }
}

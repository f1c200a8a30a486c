//! Change-event sources.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::{ChangeEvent, SyncError};

/// Something a repository can subscribe to for change events.
pub trait ChangeEventSource: Send + Sync {
    /// Start delivering events.
    ///
    /// Events arrive on the subscription's channel in delivery order. A source
    /// reports a problem with an individual event as an `Err` item; closing the
    /// channel ends the subscription.
    fn subscribe(&self) -> Result<Subscription, SyncError>;
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live subscription: the event channel plus its release hook.
pub struct Subscription {
    events: mpsc::UnboundedReceiver<Result<ChangeEvent, SyncError>>,
    handle: UnsubscribeHandle,
}

impl Subscription {
    pub fn new(
        events: mpsc::UnboundedReceiver<Result<ChangeEvent, SyncError>>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            handle: UnsubscribeHandle {
                hook: Mutex::new(Some(Box::new(unsubscribe))),
            },
        }
    }

    /// Next event, or `None` once the source has closed the channel.
    pub async fn recv(&mut self) -> Option<Result<ChangeEvent, SyncError>> {
        self.events.recv().await
    }

    /// Run the release hook. Only the first call has any effect.
    pub fn unsubscribe(&self) -> bool {
        self.handle.unsubscribe()
    }

    /// Split into the event channel and the release handle.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedReceiver<Result<ChangeEvent, SyncError>>,
        UnsubscribeHandle,
    ) {
        (self.events, self.handle)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Release hook of a subscription.
pub struct UnsubscribeHandle {
    hook: Mutex<Option<Unsubscribe>>,
}

impl UnsubscribeHandle {
    /// Run the hook. Only the first call has any effect.
    pub fn unsubscribe(&self) -> bool {
        let hook = self.hook.lock().unwrap_or_else(PoisonError::into_inner).take();
        match hook {
            Some(hook) => {
                hook();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsubscribeHandle").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unsubscribe_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&calls);
        let subscription = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(subscription.unsubscribe());
        assert!(!subscription.unsubscribe());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_into_parts_keeps_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = Arc::clone(&calls);
        let subscription = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (mut events, handle) = subscription.into_parts();
        tx.send(Ok(ChangeEvent::delete("tasks", 1))).unwrap();
        assert!(events.recv().await.unwrap().is_ok());

        assert!(handle.unsubscribe());
        assert!(!handle.unsubscribe());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

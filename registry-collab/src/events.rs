//! Change notifications for the UI layer.
//!
//! Each session exposes three [`ListenerRegistry`]s (document, cursor,
//! selection). Subscribing returns a [`Subscription`]; calling
//! [`Subscription::unsubscribe`] removes the listener. Listeners run
//! synchronously, in subscription order, on the thread that processed the
//! change.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::operation::Operation;
use crate::presence::CursorColor;

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
    /// A saved version was loaded.
    Restore,
}

/// The buffer after a change, with the operation that caused it.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub text: String,
    /// `None` for restores.
    pub operation: Option<Operation>,
    pub origin: ChangeOrigin,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorChange {
    pub site_id: String,
    pub position: usize,
    pub color: CursorColor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionChange {
    pub site_id: String,
    pub start: usize,
    pub end: usize,
    pub color: CursorColor,
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct RegistryInner<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Ordered set of listeners for one event type.
pub struct ListenerRegistry<E> {
    inner: Arc<Mutex<RegistryInner<E>>>,
}

impl<E: 'static> ListenerRegistry<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<RegistryInner<E>>> = Arc::downgrade(&self.inner);
        Subscription {
            remove: Some(Box::new(move || {
                weak.upgrade().is_some_and(|inner| {
                    let mut inner = lock(&inner);
                    let before = inner.listeners.len();
                    inner.listeners.retain(|(lid, _)| *lid != id);
                    inner.listeners.len() != before
                })
            })),
        }
    }

    /// Call every listener; returns how many were called.
    ///
    /// The listener list is snapshotted first, so a listener may unsubscribe
    /// itself (or others) while running.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<Listener<E>> = lock(&self.inner)
            .listeners
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for ListenerRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking listener must not take the registry down with it.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle returned by [`ListenerRegistry::subscribe`].
///
/// Dropping the handle keeps the listener registered.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() -> bool + Send>>,
}

impl Subscription {
    /// Remove the listener. Returns `false` if it was already gone (or the
    /// registry was dropped).
    pub fn unsubscribe(mut self) -> bool {
        self.remove.take().is_some_and(|remove| remove())
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

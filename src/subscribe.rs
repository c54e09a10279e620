//! Mutation notifications.
//!
//! Every mutation publishes a [`DbUpdate`] through a trailing debouncer:
//! bursts of writes coalesce into a single callback carrying the newest
//! head and root, fired once the database has been quiet for the configured
//! interval.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cid::Cid;
use tokio::task::JoinHandle;

/// Default quiet interval before subscribers are notified.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Snapshot of the database frontier after a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbUpdate {
    pub head: Vec<Cid>,
    pub root: Option<Cid>,
}

type Callback = Box<dyn Fn(&DbUpdate) + Send + Sync>;

/// A trailing debounce combinator.
///
/// `call` stores the newest value and (re)arms a timer; when the timer
/// fires the action runs once with whatever value arrived last.
pub struct Debounce<T> {
    interval: Duration,
    action: Arc<dyn Fn(T) + Send + Sync>,
    inner: Arc<Mutex<DebounceInner<T>>>,
}

struct DebounceInner<T> {
    latest: Option<T>,
    timer: Option<JoinHandle<()>>,
}

impl<T> fmt::Debug for Debounce<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debounce")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Debounce<T> {
    pub fn new(interval: Duration, action: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            interval,
            action: Arc::new(action),
            inner: Arc::new(Mutex::new(DebounceInner {
                latest: None,
                timer: None,
            })),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn call(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.latest = Some(value);
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let interval = self.interval;
        let action = self.action.clone();
        let shared = self.inner.clone();
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let latest = {
                let mut inner = shared.lock().unwrap();
                inner.timer = None;
                inner.latest.take()
            };
            if let Some(value) = latest {
                (*action)(value);
            }
        }));
    }
}

impl<T> Drop for Debounce<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.inner.lock().unwrap().timer.take() {
            timer.abort();
        }
    }
}

/// Fan-out registry of labelled subscribers.
pub(crate) struct Subscriptions {
    subscribers: Arc<Mutex<HashMap<String, Callback>>>,
    debounce: Debounce<DbUpdate>,
}

impl fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriptions")
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl Subscriptions {
    pub fn new(interval: Duration) -> Self {
        let subscribers: Arc<Mutex<HashMap<String, Callback>>> = Arc::default();
        let fan_out = subscribers.clone();
        let debounce = Debounce::new(interval, move |update: DbUpdate| {
            for callback in fan_out.lock().unwrap().values() {
                callback(&update);
            }
        });
        Self {
            subscribers,
            debounce,
        }
    }

    /// Register a subscriber. A second subscription under the same label
    /// replaces the first.
    pub fn subscribe(&self, label: &str, callback: impl Fn(&DbUpdate) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .unwrap()
            .insert(label.to_string(), Box::new(callback));
    }

    pub fn unsubscribe(&self, label: &str) -> bool {
        self.subscribers.lock().unwrap().remove(label).is_some()
    }

    pub fn publish(&self, update: DbUpdate) {
        self.debounce.call(update);
    }
}

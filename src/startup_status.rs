//! Startup status reporting and ambient logging initialization.
//!
//! Two unrelated concerns share this module because both are cross-cutting
//! start-of-day services rather than part of any one component: a
//! `tracing-subscriber` init helper, and a small publish/subscribe channel a
//! daemon uses to report mount-startup progress to whatever is watching (a
//! CLI invocation waiting on the mount to come up, a systemd readiness
//! notifier, a control-socket stream).

use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber from `RUST_LOG` (defaulting to
/// `info`), built on `tracing_subscriber`'s `EnvFilter`.
/// Idempotent: a second call is a harmless no-op if a subscriber is already
/// installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Something that wants to observe startup status updates.
///
/// `publish` must not block for long and must not call back into the
/// [`StartupStatusChannel`] that invoked it — the channel holds its internal
/// lock for the duration of the call, so a reentrant call deadlocks. This is
/// the same "narrow callback contract" the Journal's subscriber mechanism
/// uses.
pub trait StartupStatusSubscriber: Send + Sync {
    fn publish(&self, data: &str);
}

impl<F: Fn(&str) + Send + Sync> StartupStatusSubscriber for F {
    fn publish(&self, data: &str) {
        self(data)
    }
}

struct ChannelState {
    subscribers: Vec<Arc<dyn StartupStatusSubscriber>>,
    complete: bool,
}

/// Shared state tracking where to publish startup status updates to, and
/// whether startup has finished. Once `complete()` is called, newly added
/// subscribers are dropped immediately rather than retained — there is
/// nothing left to tell them.
pub struct StartupStatusChannel {
    state: Mutex<ChannelState>,
}

impl Default for StartupStatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupStatusChannel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                subscribers: Vec::new(),
                complete: false,
            }),
        }
    }

    /// Registers a subscriber. Returns `false` (and drops the subscriber) if
    /// startup has already completed.
    pub fn subscribe(&self, subscriber: Arc<dyn StartupStatusSubscriber>) -> bool {
        let mut state = self.state.lock();
        if state.complete {
            return false;
        }
        state.subscribers.push(subscriber);
        true
    }

    /// Publishes `data` to every currently-registered subscriber, in
    /// registration order.
    pub fn publish(&self, data: &str) {
        let state = self.state.lock();
        for subscriber in &state.subscribers {
            subscriber.publish(data);
        }
    }

    /// Marks startup complete; every subscriber is dropped and future
    /// `subscribe` calls are rejected.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        state.subscribers.clear();
        state.complete = true;
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publishes_to_all_subscribers() {
        let channel = StartupStatusChannel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        channel.subscribe(Arc::new(move |_: &str| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = count.clone();
        channel.subscribe(Arc::new(move |_: &str| {
            c2.fetch_add(1, Ordering::SeqCst);
        }));
        channel.publish("mounting");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscribe_after_complete_is_rejected() {
        let channel = StartupStatusChannel::new();
        channel.complete();
        let accepted = channel.subscribe(Arc::new(|_: &str| {}));
        assert!(!accepted);
    }

    #[test]
    fn complete_drops_subscribers() {
        let channel = StartupStatusChannel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        channel.subscribe(Arc::new(move |_: &str| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        channel.complete();
        channel.publish("ignored");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

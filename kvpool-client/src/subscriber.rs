//! # Subscription Handle
//!
//! Purpose: A client handle whose session carries channel subscriptions, and
//! which can move those subscriptions onto a fresh session.
//!
//! ## Design Principles
//! 1. **Registry Outlives Sessions**: (channel, callback) pairs live in a
//!    `SnapshotList` owned by the handle, not by the session, so they can be
//!    replayed after a reconnect.
//! 2. **Ordered Replay**: Reconnects subscribe every channel again in
//!    registration order; one failing channel is logged and skipped.
//! 3. **Callbacks Off the Delivery Path**: The session only queues messages
//!    into an inbox; the scheduler's drain runs user callbacks.
//!
//! ## Message Flow
//!
//! ```text
//! store thread --sink--> inbox (SnapshotList<Message>)
//!                          |  scheduler poll -> drain task
//!                          v
//!                    dispatch -> callbacks whose channel matches
//! ```

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use kvpool_common::{Message, PoolKey, StoreResult};
use kvpool_sync::{ProcessFn, Scheduler, SnapshotList};

use crate::handle::ClientHandle;
use crate::metrics::PoolMetrics;
use crate::pool::{Lease, Resource};
use crate::store::{Connector, MessageSink, Session};

/// Callback run for every message on a subscribed channel.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// One registered (channel, callback) pair.
#[derive(Clone)]
pub struct Subscription {
    channel: String,
    callback: MessageCallback,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Pooled handle for channel subscriptions.
pub struct SubscriptionHandle<C: Connector> {
    handle: ClientHandle<C>,
    connector: Arc<C>,
    scheduler: Arc<Scheduler>,
    subscriptions: SnapshotList<Subscription>,
    inbox: SnapshotList<Message>,
    sink: MessageSink,
    poll: Duration,
    // Serializes channel changes on the session against `reset`.
    session_lock: Mutex<()>,
}

impl<C: Connector> SubscriptionHandle<C> {
    /// Opens a subscriber session for `key`.
    pub(crate) fn open(
        connector: &Arc<C>,
        key: PoolKey,
        metrics: Arc<PoolMetrics>,
        scheduler: &Arc<Scheduler>,
        poll: Duration,
    ) -> StoreResult<Self> {
        let session = connector.connect_subscriber(&key.endpoint)?;
        let handle = ClientHandle::with_session(key, session, metrics);
        Ok(Self::assemble(handle, connector, scheduler, poll, &[]))
    }

    /// A dead subscriber handle for a failed connect.
    pub(crate) fn sentinel(
        connector: &Arc<C>,
        key: PoolKey,
        metrics: Arc<PoolMetrics>,
        scheduler: &Arc<Scheduler>,
        poll: Duration,
    ) -> Self {
        let handle = ClientHandle::sentinel(key, metrics);
        Self::assemble(handle, connector, scheduler, poll, &[])
    }

    fn assemble(
        handle: ClientHandle<C>,
        connector: &Arc<C>,
        scheduler: &Arc<Scheduler>,
        poll: Duration,
        existing: &[Subscription],
    ) -> Self {
        let subscriptions = SnapshotList::with_scheduler(Arc::clone(scheduler));
        for subscription in existing {
            subscriptions.add(subscription.clone());
        }
        let inbox = SnapshotList::with_options(Arc::clone(scheduler), false);

        let dispatch: ProcessFn<Message> = {
            let subscriptions = subscriptions.clone();
            Arc::new(move |message: Message| {
                for subscription in subscriptions.cache().iter() {
                    if subscription.channel == message.channel {
                        (subscription.callback)(&message);
                    }
                }
            })
        };
        let sink: MessageSink = {
            let inbox = inbox.clone();
            Arc::new(move |message: Message| inbox.add_with(message, Arc::clone(&dispatch)))
        };

        SubscriptionHandle {
            handle,
            connector: Arc::clone(connector),
            scheduler: Arc::clone(scheduler),
            subscriptions,
            inbox,
            sink,
            poll,
            session_lock: Mutex::new(()),
        }
    }

    /// The underlying client handle.
    pub fn handle(&self) -> &ClientHandle<C> {
        &self.handle
    }

    /// Registers `on_message` for `channel` and subscribes the session.
    ///
    /// The pair is kept even when the session is dead or refuses, so a later
    /// reset or clone replays it. Returns whether the live session accepted.
    pub fn subscribe<F>(&self, channel: &str, on_message: F) -> bool
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let _session = self.session_lock.lock();
        self.subscriptions.add(Subscription {
            channel: channel.to_string(),
            callback: Arc::new(on_message),
        });
        self.handle.call_or_default("subscribe", |session| {
            session
                .subscribe(channel, Arc::clone(&self.sink))
                .map(|()| true)
        })
    }

    /// Drops every callback registered for `channel`; returns whether any was.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        let _session = self.session_lock.lock();
        let removed = self
            .subscriptions
            .remove_where(|subscription| subscription.channel == channel);
        if removed > 0 {
            self.handle
                .call_or_default("unsubscribe", |session| session.unsubscribe(channel));
        }
        removed > 0
    }

    /// Registered pairs in registration order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions.cache().to_vec()
    }

    /// Distinct channels in registration order.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = Vec::new();
        for subscription in self.subscriptions.cache().iter() {
            if !channels.contains(&subscription.channel) {
                channels.push(subscription.channel.clone());
            }
        }
        channels
    }

    /// Moves this live handle onto a fresh session and replays its subscriptions.
    ///
    /// Returns false, leaving the handle unchanged, when it is already dead,
    /// the connect fails, or the session was invalidated meanwhile. A dead
    /// handle is recovered with `clone_session` instead.
    ///
    /// Concurrent `subscribe` and `unsubscribe` calls wait for the reset, so
    /// they land on whichever session survives it. Delivery is at-least-once
    /// across a reset: until the old session is closed both sessions carry the
    /// replayed channels, and a message published in that window may reach
    /// its callbacks twice.
    pub fn reset(&self) -> bool {
        let _session = self.session_lock.lock();
        let Some(current) = self.handle.live_session() else {
            return false;
        };
        let key = self.handle.key();
        let fresh = match self.connector.connect_subscriber(&key.endpoint) {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!(endpoint = %key.endpoint, error = %err, "subscriber reset failed to connect");
                return false;
            }
        };

        self.replay(&fresh);
        if !self.handle.replace_session(&current, Arc::clone(&fresh)) {
            fresh.close();
            return false;
        }
        current.close();
        self.handle.reset_idle();
        debug!(handle = self.handle.id(), endpoint = %key.endpoint, "subscriber reset");
        true
    }

    /// Opens a new handle on a fresh session carrying copies of this
    /// handle's subscriptions, replayed in order.
    ///
    /// Works on dead handles. A failed connect yields a dead handle that still
    /// carries the subscriptions.
    pub fn clone_session(&self) -> SubscriptionHandle<C> {
        let key = self.handle.key().clone();
        let metrics = Arc::clone(self.handle.metrics());
        let existing = self.subscriptions.cache();

        let handle = match self.connector.connect_subscriber(&key.endpoint) {
            Ok(session) => {
                metrics.record_open();
                ClientHandle::with_session(key, session, metrics)
            }
            Err(err) => {
                metrics.record_connect_failure();
                warn!(endpoint = %key.endpoint, error = %err, "subscriber clone failed to connect");
                ClientHandle::sentinel(key, metrics)
            }
        };

        let cloned = Self::assemble(handle, &self.connector, &self.scheduler, self.poll, &existing);
        if let Some(session) = cloned.handle.live_session() {
            cloned.replay(&session);
        }
        cloned
    }

    /// Blocks until queued messages have been dispatched.
    pub fn wait_delivered(&self) {
        self.inbox.wait_idle(self.poll);
    }

    /// Suspends until queued messages have been dispatched.
    pub async fn wait_delivered_async(&self) {
        self.inbox.wait_idle_async(self.poll).await;
    }

    /// Subscribes every registered channel on `session`, in order.
    fn replay(&self, session: &C::Session) {
        for channel in self.channels() {
            if let Err(err) = session.subscribe(&channel, Arc::clone(&self.sink)) {
                warn!(
                    endpoint = %self.handle.key().endpoint,
                    channel = %channel,
                    error = %err,
                    "failed to replay subscription; skipping channel"
                );
            }
        }
    }
}

impl<C: Connector> Lease<SubscriptionHandle<C>> {
    /// `SubscriptionHandle::clone_session`, leased from the same pool.
    pub fn clone_session(&self) -> Lease<SubscriptionHandle<C>> {
        self.sibling(Arc::new(self.handle().clone_session()))
    }
}

impl<C: Connector> Deref for SubscriptionHandle<C> {
    type Target = ClientHandle<C>;

    fn deref(&self) -> &ClientHandle<C> {
        &self.handle
    }
}

impl<C: Connector> Resource for SubscriptionHandle<C> {
    fn key(&self) -> &PoolKey {
        self.handle.key()
    }

    fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    fn is_expired(&self) -> bool {
        self.handle.is_expired()
    }

    fn close(&self) {
        self.handle.invalidate();
    }
}

impl<C: Connector> Drop for SubscriptionHandle<C> {
    fn drop(&mut self) {
        self.inbox.stop_draining();
    }
}

impl<C: Connector> fmt::Debug for SubscriptionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("handle", &self.handle)
            .field("subscriptions", &self.subscriptions.len())
            .field("queued", &self.inbox.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;

    use kvpool_common::{Command, SchedulerConfig, Value};

    use crate::memory::{MemoryConnector, MemorySession};

    /// Parks the first subscribe on a session until the test lets it go.
    struct Pause {
        reached: Sender<()>,
        resume: Receiver<()>,
    }

    /// Memory store whose next subscriber session can be armed with a `Pause`.
    #[derive(Clone, Default)]
    struct PausingConnector {
        store: MemoryConnector,
        armed: Arc<Mutex<Option<Pause>>>,
    }

    impl PausingConnector {
        /// Arms the next subscriber session; returns (reached, resume) ends.
        fn arm(&self) -> (Receiver<()>, Sender<()>) {
            let (reached_tx, reached_rx) = mpsc::channel();
            let (resume_tx, resume_rx) = mpsc::channel();
            *self.armed.lock() = Some(Pause {
                reached: reached_tx,
                resume: resume_rx,
            });
            (reached_rx, resume_tx)
        }
    }

    struct PausingSession {
        inner: MemorySession,
        pause: Mutex<Option<Pause>>,
    }

    impl Session for PausingSession {
        fn is_usable(&self) -> bool {
            self.inner.is_usable()
        }

        fn execute(&self, command: &Command) -> StoreResult<Value> {
            self.inner.execute(command)
        }

        fn subscribe(&self, channel: &str, sink: MessageSink) -> StoreResult<()> {
            let pause = self.pause.lock().take();
            if let Some(pause) = pause {
                let _ = pause.reached.send(());
                let _ = pause.resume.recv();
            }
            self.inner.subscribe(channel, sink)
        }

        fn unsubscribe(&self, channel: &str) -> StoreResult<()> {
            self.inner.unsubscribe(channel)
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    impl Connector for PausingConnector {
        type Session = PausingSession;

        fn connect(&self, endpoint: &str) -> StoreResult<PausingSession> {
            Ok(PausingSession {
                inner: self.store.connect(endpoint)?,
                pause: Mutex::new(None),
            })
        }

        fn connect_subscriber(&self, endpoint: &str) -> StoreResult<PausingSession> {
            Ok(PausingSession {
                inner: self.store.connect_subscriber(endpoint)?,
                pause: Mutex::new(self.armed.lock().take()),
            })
        }
    }

    fn open<C: Connector + Clone>(connector: &C) -> SubscriptionHandle<C> {
        let scheduler = Arc::new(Scheduler::new(SchedulerConfig::default()));
        SubscriptionHandle::open(
            &Arc::new(connector.clone()),
            PoolKey::new("memory", Duration::from_secs(60)),
            Arc::new(PoolMetrics::new()),
            &scheduler,
            Duration::from_millis(1),
        )
        .unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Message) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |message: &Message| {
            sink.lock()
                .push(String::from_utf8_lossy(&message.payload).into_owned())
        })
    }

    #[test]
    fn messages_reach_matching_callbacks() {
        let connector = MemoryConnector::new();
        let handle = open(&connector);
        let (news, on_news) = recorder();
        let (sports, on_sports) = recorder();
        assert!(handle.subscribe("news", on_news));
        assert!(handle.subscribe("sports", on_sports));

        assert_eq!(connector.publish("news", "one"), 1);
        assert_eq!(connector.publish("news", "two"), 1);
        handle.wait_delivered();

        assert_eq!(*news.lock(), vec!["one", "two"]);
        assert!(sports.lock().is_empty());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let connector = MemoryConnector::new();
        let handle = open(&connector);
        let (_, on_news) = recorder();
        handle.subscribe("news", on_news);
        assert!(handle.unsubscribe("news"));
        assert!(!handle.unsubscribe("news"));
        assert_eq!(connector.subscribers_of("news"), 0);
        assert!(handle.channels().is_empty());
    }

    #[test]
    fn reset_on_dead_handle_is_refused() {
        let connector = MemoryConnector::new();
        let handle = open(&connector);
        handle.invalidate();
        assert!(!handle.reset());
        assert!(!handle.is_alive());
    }

    #[test]
    fn clone_recovers_dead_handle() {
        let connector = MemoryConnector::new();
        let handle = open(&connector);
        let (seen, on_news) = recorder();
        handle.subscribe("news", on_news);
        connector.kill_sessions();
        assert!(!handle.is_alive());

        let cloned = handle.clone_session();
        assert!(cloned.is_alive());
        assert_eq!(cloned.channels(), vec!["news".to_string()]);

        connector.publish("news", "back");
        cloned.wait_delivered();
        assert_eq!(*seen.lock(), vec!["back"]);
    }

    #[test]
    fn subscribe_during_reset_lands_on_new_session() {
        let connector = PausingConnector::default();
        let handle = Arc::new(open(&connector));
        assert!(handle.subscribe("a", |_| {}));

        let (reached, resume) = connector.arm();
        let resetting = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.reset())
        };
        reached.recv().unwrap();

        let subscribing = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.subscribe("x", |_| {}))
        };
        thread::sleep(Duration::from_millis(20));
        resume.send(()).unwrap();

        assert!(resetting.join().unwrap());
        assert!(subscribing.join().unwrap());
        assert!(handle.is_alive());
        assert_eq!(handle.channels(), vec!["a".to_string(), "x".to_string()]);
        assert_eq!(connector.store.subscribers_of("a"), 1);
        assert_eq!(connector.store.subscribers_of("x"), 1);
    }

    #[test]
    fn reset_leaves_one_delivery_per_message() {
        let connector = MemoryConnector::new();
        let handle = open(&connector);
        let (seen, on_news) = recorder();
        handle.subscribe("news", on_news);

        assert!(handle.reset());
        assert_eq!(connector.subscribers_of("news"), 1);
        assert_eq!(connector.publish("news", "after"), 1);
        handle.wait_delivered();
        assert_eq!(*seen.lock(), vec!["after"]);
    }
}

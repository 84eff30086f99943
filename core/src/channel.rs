// In-process broadcast channel
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::transport::{LinkState, Transport};
use crate::{BusError, Envelope, Result};

/// Default backlog per subscriber above which a lagging subscriber is logged.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Category of a transport fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Broker connection could not be established
    Connect,
    /// Inbound message was not a valid envelope
    Decode,
    /// Broker rejected or failed a publish
    Publish,
    /// Any other broker-side failure (lost connection, channel error)
    Broker,
}

/// Non-terminal fault notification carried on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&BusError> for Fault {
    fn from(err: &BusError) -> Self {
        let kind = match err {
            BusError::Connect(_) | BusError::ConnectTimeout(_) => FaultKind::Connect,
            BusError::Decode(_) => FaultKind::Decode,
            BusError::Publish(_) => FaultKind::Publish,
            _ => FaultKind::Broker,
        };
        Fault::new(kind, err.to_string())
    }
}

/// Everything observable on a channel.
#[derive(Debug, Clone)]
pub enum Signal {
    Envelope(Envelope),
    Fault(Fault),
    Completed,
}

/// Receiving end of a channel subscription.
///
/// Every subscription observes every signal published after it was created,
/// in publish order. Nothing is dropped for a slow subscriber; its backlog
/// grows instead.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Signal>,
    backlog: Arc<AtomicUsize>,
    done: bool,
}

impl Subscription {
    fn new(rx: mpsc::UnboundedReceiver<Signal>, backlog: Arc<AtomicUsize>) -> Self {
        Self {
            rx,
            backlog,
            done: false,
        }
    }

    fn finished() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            backlog: Arc::new(AtomicUsize::new(0)),
            done: true,
        }
    }

    /// Next signal, or `None` once the channel completed.
    pub async fn recv(&mut self) -> Option<Signal> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(signal) => {
                self.backlog.fetch_sub(1, Ordering::Relaxed);
                if matches!(signal, Signal::Completed) {
                    self.done = true;
                }
                Some(signal)
            }
            None => {
                self.done = true;
                None
            }
        }
    }

    /// Next envelope, skipping faults. `None` once the channel completed.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.recv().await? {
                Signal::Envelope(env) => return Some(env),
                Signal::Fault(_) => continue,
                Signal::Completed => return None,
            }
        }
    }

    /// Next fault, skipping envelopes. `None` once the channel completed.
    pub async fn recv_fault(&mut self) -> Option<Fault> {
        loop {
            match self.recv().await? {
                Signal::Fault(fault) => return Some(fault),
                Signal::Envelope(_) => continue,
                Signal::Completed => return None,
            }
        }
    }
}

struct Subscriber {
    tx: mpsc::UnboundedSender<Signal>,
    backlog: Arc<AtomicUsize>,
}

#[derive(Default)]
struct Subscribers {
    list: Vec<Subscriber>,
    closed: bool,
}

/// Ordered, multi-subscriber broadcast of envelopes.
///
/// `Channel` is also the default in-memory [`Transport`]: publishing loops the
/// envelope straight back to local subscribers, and it is always connected.
#[derive(Clone)]
pub struct Channel {
    subscribers: Arc<Mutex<Subscribers>>,
    lag_warning: usize,
    closed: Arc<AtomicBool>,
}

impl Channel {
    /// Channel that warns once a subscriber has `capacity` signals queued.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            lag_warning: capacity.max(1),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        // The list is never left half-updated, so poisoning is harmless
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // Fan out under the lock so every subscriber sees one global order
    fn send(&self, signal: Signal) -> bool {
        let mut subs = self.lock();
        if subs.closed {
            return false;
        }
        let lag_warning = self.lag_warning;
        subs.list.retain(|sub| {
            let queued = sub.backlog.fetch_add(1, Ordering::Relaxed) + 1;
            if sub.tx.send(signal.clone()).is_err() {
                return false;
            }
            if queued == lag_warning {
                warn!(target: "busline::channel", queued, "Subscriber lagging behind");
            }
            true
        });
        true
    }

    /// Deliver an envelope to all current subscribers.
    pub fn publish(&self, envelope: Envelope) -> Result<()> {
        debug!(target: "busline::channel", r#type = %envelope.r#type, "Publishing envelope");
        // No subscribers is not an error
        if self.send(Signal::Envelope(envelope)) {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }

    /// Subscribe to every signal published from now on. A subscription taken
    /// after `complete()` ends immediately.
    pub fn subscribe(&self) -> Subscription {
        let mut subs = self.lock();
        if subs.closed {
            return Subscription::finished();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        subs.list.push(Subscriber {
            tx,
            backlog: Arc::clone(&backlog),
        });
        Subscription::new(rx, backlog)
    }

    /// Broadcast a fault notification; the channel stays usable.
    pub fn fault(&self, fault: Fault) {
        self.send(Signal::Fault(fault));
    }

    /// Terminal shutdown. Idempotent.
    pub fn complete(&self) {
        let mut subs = self.lock();
        if subs.closed {
            return;
        }
        subs.closed = true;
        self.closed.store(true, Ordering::SeqCst);
        for sub in subs.list.drain(..) {
            sub.backlog.fetch_add(1, Ordering::Relaxed);
            let _ = sub.tx.send(Signal::Completed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.lock();
        subs.list.retain(|sub| !sub.tx.is_closed());
        subs.list.len()
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Transport for Channel {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn next(&self, envelope: Envelope) -> Result<()> {
        self.publish(envelope)
    }

    fn subscribe(&self) -> Subscription {
        Channel::subscribe(self)
    }

    fn error(&self, fault: Fault) {
        // Always connected, so the system_error goes out first
        let _ = self.publish(Envelope::system_error(fault.message.clone()));
        self.fault(fault);
    }

    async fn complete(&self) {
        Channel::complete(self);
    }

    fn state(&self) -> LinkState {
        if self.is_closed() {
            LinkState::Closed
        } else {
            LinkState::Connected
        }
    }

    async fn wait_for_connection(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn every_subscriber_sees_every_envelope_in_order() {
        let channel = Channel::default();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        for i in 0..3 {
            channel.publish(Envelope::event("n", json!(i))).unwrap();
        }

        for sub in [&mut a, &mut b] {
            for i in 0..3 {
                let env = sub.recv_envelope().await.unwrap();
                assert_eq!(env.payload, json!(i));
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let channel = Channel::default();
        assert!(channel.publish(Envelope::event("nobody", json!(null))).is_ok());
    }

    #[tokio::test]
    async fn complete_ends_subscriptions_and_rejects_publishes() {
        let channel = Channel::default();
        let mut sub = channel.subscribe();
        channel.complete();

        assert!(matches!(sub.recv().await, Some(Signal::Completed)));
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            channel.publish(Envelope::event("late", json!(1))),
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn faults_do_not_close_the_channel() {
        let channel = Channel::default();
        let mut sub = channel.subscribe();
        channel.fault(Fault::new(FaultKind::Publish, "boom"));
        channel.publish(Envelope::event("after", json!(1))).unwrap();

        let fault = sub.recv_fault().await.unwrap();
        assert_eq!(fault.kind, FaultKind::Publish);
        let env = tokio::time::timeout(Duration::from_millis(200), sub.recv_envelope())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(env.r#type, "after");
    }

    #[tokio::test]
    async fn slow_subscriber_misses_nothing() {
        let channel = Channel::new(2);
        let mut sub = channel.subscribe();
        for i in 0..500 {
            channel.publish(Envelope::event("n", json!(i))).unwrap();
        }
        for i in 0..500 {
            let env = sub.recv_envelope().await.unwrap();
            assert_eq!(env.payload, json!(i));
        }
    }

    #[tokio::test]
    async fn subscribe_after_complete_ends_at_once() {
        let channel = Channel::default();
        channel.complete();
        let mut sub = channel.subscribe();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let channel = Channel::default();
        let kept = channel.subscribe();
        drop(channel.subscribe());
        channel.publish(Envelope::event("n", json!(1))).unwrap();
        assert_eq!(channel.subscriber_count(), 1);
        drop(kept);
    }

    #[tokio::test]
    async fn error_publishes_system_error_before_the_fault() {
        let channel = Channel::default();
        let mut sub = channel.subscribe();
        Transport::error(&channel, Fault::new(FaultKind::Broker, "boom"));

        match sub.recv().await {
            Some(Signal::Envelope(env)) => assert_eq!(env, Envelope::system_error("boom")),
            other => panic!("expected system_error envelope, got {other:?}"),
        }
        match sub.recv().await {
            Some(Signal::Fault(fault)) => {
                assert_eq!(fault, Fault::new(FaultKind::Broker, "boom"))
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert!(channel.is_connected());
    }
}

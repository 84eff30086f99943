//! Event/command bus on top of any [`Transport`].
//!
//! Three operations are exposed:
//!
//! - [`Bus::emit`] publishes a fire-and-forget event.
//! - [`Bus::on`] registers a handler for every envelope of a given type and,
//!   for requests, publishes its outcome as a `{type}_response` or
//!   `{type}_error` reply.
//! - [`Bus::execute`] publishes a request and resolves with the first reply
//!   that carries the same correlation id and reply type.
//!
//! Replies are matched by a single dispatcher task per bus against a table
//! of pending calls, so concurrent `execute` calls never see each other's
//! replies.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Fault, FaultKind, Signal, Subscription};
use crate::envelope::{self, EnvelopeKind};
use crate::handler::{FnHandler, Handler, HandlerError};
use crate::transport::{LinkState, Transport};
use crate::{BusError, Envelope, Result};

/// Default upper bound on how long `execute` waits for a reply.
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusOptions {
    /// `None` waits for a reply indefinitely
    pub execute_timeout: Option<Duration>,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            execute_timeout: Some(DEFAULT_EXECUTE_TIMEOUT),
        }
    }
}

/// Bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStats {
    pub emitted: u64,
    pub executed: u64,
    pub replies_matched: u64,
    pub unmatched_replies: u64,
    pub handler_failures: u64,
    pub timeouts: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    emitted: AtomicU64,
    executed: AtomicU64,
    replies_matched: AtomicU64,
    unmatched_replies: AtomicU64,
    handler_failures: AtomicU64,
    timeouts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Pending {
    command: String,
    reply: oneshot::Sender<Result<Envelope>>,
}

type PendingTable = Arc<DashMap<String, Pending>>;

// Removes the pending entry however the execute call ends
struct PendingGuard {
    pending: PendingTable,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    pending: PendingTable,
    counters: Arc<Counters>,
    options: BusOptions,
    dispatcher: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Transport-agnostic event/command bus. Cheap to clone.
///
/// ```
/// use busline_core::{Bus, HandlerError};
/// use serde_json::{json, Value};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> busline_core::Result<()> {
/// let bus = Bus::new();
/// bus.on("ping", |_: Value| async { Ok::<_, HandlerError>("pong") });
///
/// let reply: String = bus.execute("ping", json!({})).await?;
/// assert_eq!(reply, "pong");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Bus over a fresh in-memory channel. Must be called inside a tokio
    /// runtime.
    pub fn new() -> Self {
        Self::with_transport(Arc::new(Channel::default()))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, BusOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: BusOptions) -> Self {
        let pending: PendingTable = Arc::new(DashMap::new());
        let counters = Arc::new(Counters::default());
        // Subscribe before spawning so no reply published after this returns
        // can be missed
        let replies = transport.subscribe();
        let dispatcher = tokio::spawn(dispatch_replies(
            replies,
            Arc::clone(&transport),
            Arc::clone(&pending),
            Arc::clone(&counters),
        ));
        info!(target: "busline::bus", transport = transport.name(), "Bus started");
        Self {
            inner: Arc::new(Inner {
                transport,
                pending,
                counters,
                options,
                dispatcher,
            }),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn options(&self) -> &BusOptions {
        &self.inner.options
    }

    /// Wait until the transport finished its initial connect.
    pub async fn ready(&self) -> Result<()> {
        self.inner.transport.wait_for_connection().await
    }

    /// Publish a fire-and-forget event. Zero listeners is not an error.
    pub fn emit<P: Serialize>(&self, event_type: &str, payload: P) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        debug!(target: "busline::bus", r#type = %event_type, "Emitting event");
        self.inner
            .transport
            .next(Envelope::event(event_type, payload))?;
        Counters::bump(&self.inner.counters.emitted);
        Ok(())
    }

    /// Register a typed async handler for `event_type`.
    ///
    /// The handler runs for every envelope of that type. When the envelope
    /// carries a correlation id its result is published as the matching
    /// `_response` or `_error` reply; otherwise the result is discarded.
    ///
    /// The registration stays active until [`HandlerRegistration::cancel`] is
    /// called or the transport completes.
    pub fn on<T, R, F, Fut>(&self, event_type: &str, f: F) -> HandlerRegistration
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HandlerError>> + Send + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.on_handler(event_type, Arc::new(FnHandler::new(f)))
    }

    /// Register a type-erased handler for `event_type`.
    pub fn on_handler(&self, event_type: &str, handler: Arc<dyn Handler>) -> HandlerRegistration {
        let event_type = event_type.to_string();
        let mut envelopes = self.inner.transport.subscribe();
        let transport = Arc::clone(&self.inner.transport);
        let counters = Arc::clone(&self.inner.counters);
        let ty = event_type.clone();

        info!(target: "busline::bus", r#type = %event_type, "Handler registered");
        let task = tokio::spawn(async move {
            while let Some(signal) = envelopes.recv().await {
                let env = match signal {
                    Signal::Envelope(env) if env.r#type == ty => env,
                    Signal::Envelope(_) | Signal::Fault(_) => continue,
                    Signal::Completed => break,
                };
                tokio::spawn(invoke(
                    Arc::clone(&handler),
                    Arc::clone(&transport),
                    Arc::clone(&counters),
                    env,
                ));
            }
            debug!(target: "busline::bus", r#type = %ty, "Handler listener stopped");
        });

        HandlerRegistration { event_type, task }
    }

    /// Send a command and wait for its reply, decoded into `R`.
    ///
    /// Fails with [`BusError::Handler`] when the handler reported an error,
    /// [`BusError::Timeout`] when no reply arrived within the configured
    /// timeout, [`BusError::Connect`] when the transport could not connect and
    /// [`BusError::Closed`] when the transport completed first.
    pub async fn execute<P, R>(&self, command_type: &str, payload: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload)?;
        let reply = self.execute_raw(command_type, payload).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Like [`execute`](Self::execute) but returns the raw reply payload.
    pub async fn execute_raw(&self, command_type: &str, payload: Value) -> Result<Value> {
        if let LinkState::Failed(message) = self.inner.transport.state() {
            return Err(BusError::Connect(message));
        }
        let correlation_id = envelope::new_correlation_id();
        let (reply_tx, reply_rx) = oneshot::channel();

        // Register before publishing; a local handler may reply immediately
        self.inner.pending.insert(
            correlation_id.clone(),
            Pending {
                command: command_type.to_string(),
                reply: reply_tx,
            },
        );
        let _guard = PendingGuard {
            pending: Arc::clone(&self.inner.pending),
            correlation_id: correlation_id.clone(),
        };

        debug!(target: "busline::bus", r#type = %command_type, correlation_id = %correlation_id, "Executing command");
        self.inner.transport.next(Envelope::request(
            command_type,
            payload,
            correlation_id.clone(),
        ))?;
        Counters::bump(&self.inner.counters.executed);

        let reply = match self.inner.options.execute_timeout {
            Some(limit) => match timeout(limit, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    Counters::bump(&self.inner.counters.timeouts);
                    warn!(target: "busline::bus", r#type = %command_type, correlation_id = %correlation_id, "Command timeout");
                    return Err(BusError::Timeout(limit));
                }
            },
            None => reply_rx.await,
        }
        .map_err(|_| BusError::Closed)??;

        match reply.kind() {
            EnvelopeKind::Error => Err(BusError::Handler(HandlerError::from_payload(
                &reply.payload,
            ))),
            _ => Ok(reply.payload),
        }
    }

    /// Stream of transport faults.
    pub fn errors(&self) -> FaultStream {
        FaultStream {
            inner: self.inner.transport.subscribe(),
        }
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            emitted: c.emitted.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            replies_matched: c.replies_matched.load(Ordering::Relaxed),
            unmatched_replies: c.unmatched_replies.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            pending: self.inner.pending.len(),
        }
    }

    /// Complete the transport. Pending `execute` calls fail with
    /// [`BusError::Closed`] and handler listeners stop.
    pub async fn shutdown(&self) {
        info!(target: "busline::bus", transport = self.inner.transport.name(), "Bus shutting down");
        self.inner.transport.complete().await;
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an active handler registration.
///
/// Dropping it leaves the handler running; call [`cancel`](Self::cancel) to
/// stop it.
pub struct HandlerRegistration {
    event_type: String,
    task: JoinHandle<()>,
}

impl HandlerRegistration {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Stop receiving envelopes. Invocations already running finish.
    pub fn cancel(self) {
        debug!(target: "busline::bus", r#type = %self.event_type, "Handler cancelled");
        self.task.abort();
    }
}

/// Faults reported by the bus transport.
pub struct FaultStream {
    inner: Subscription,
}

impl FaultStream {
    /// Next fault, or `None` once the transport completed.
    pub async fn next(&mut self) -> Option<Fault> {
        self.inner.recv_fault().await
    }
}

async fn dispatch_replies(
    mut replies: Subscription,
    transport: Arc<dyn Transport>,
    pending: PendingTable,
    counters: Arc<Counters>,
) {
    while let Some(signal) = replies.recv().await {
        let env = match signal {
            Signal::Envelope(env) => env,
            Signal::Fault(fault) if fault.kind == FaultKind::Connect => {
                // A failed connect is fatal; nothing queued will ever be sent
                if let LinkState::Failed(message) = transport.state() {
                    fail_pending(&pending, &message);
                }
                continue;
            }
            Signal::Fault(_) => continue,
            Signal::Completed => break,
        };
        let (Some(command), Some(id)) = (env.command_type(), env.correlation_id.as_deref()) else {
            continue;
        };
        match pending.remove_if(id, |_, p| p.command == command) {
            Some((_, entry)) => {
                Counters::bump(&counters.replies_matched);
                // Receiver gone means the caller already timed out
                let _ = entry.reply.send(Ok(env));
            }
            None => {
                Counters::bump(&counters.unmatched_replies);
                debug!(target: "busline::bus", r#type = %env.r#type, correlation_id = %id, "Ignoring reply with no pending request");
            }
        }
    }
    // Dropping the senders fails every outstanding execute with Closed
    pending.clear();
    debug!(target: "busline::bus", "Reply dispatcher stopped");
}

fn fail_pending(pending: &PendingTable, message: &str) {
    let ids: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    for id in ids {
        if let Some((_, entry)) = pending.remove(&id) {
            debug!(target: "busline::bus", r#type = %entry.command, correlation_id = %id, "Failing command after connect error");
            let _ = entry.reply.send(Err(BusError::Connect(message.to_string())));
        }
    }
}

async fn invoke(
    handler: Arc<dyn Handler>,
    transport: Arc<dyn Transport>,
    counters: Arc<Counters>,
    env: Envelope,
) {
    let Envelope {
        r#type,
        payload,
        correlation_id,
    } = env;

    let outcome = match AssertUnwindSafe(handler.call(payload)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(HandlerError::new(panic_message(panic))),
    };

    if outcome.is_err() {
        Counters::bump(&counters.handler_failures);
    }

    let Some(correlation_id) = correlation_id else {
        if let Err(err) = outcome {
            debug!(target: "busline::bus", r#type = %r#type, error = %err, "Event handler failed");
        }
        return;
    };
    let reply = match outcome {
        Ok(value) => Envelope::response(&r#type, value, correlation_id),
        Err(err) => {
            warn!(target: "busline::bus", r#type = %r#type, correlation_id = %correlation_id, error = %err, "Command handler failed");
            Envelope::error(&r#type, err.to_payload(), correlation_id)
        }
    };
    if let Err(err) = transport.next(reply) {
        warn!(target: "busline::bus", r#type = %r#type, error = %err, "Failed to publish reply");
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

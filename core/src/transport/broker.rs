// Broker-backed transport state machine
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::{LinkState, Transport};
use crate::channel::{Channel, Fault, FaultKind, Subscription};
use crate::envelope;
use crate::{BusError, Envelope, Result};

/// Connect timeout used by adapters that do not configure one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-broker glue driven by [`BrokerTransport`].
///
/// Implementations own their client handles. `connect` performs the handshake
/// and initial subscribe and hands inbound raw messages to the [`Inbound`]
/// handle from a reader task it spawns itself.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + 'static {
    fn name(&self) -> &'static str;

    /// How long `wait_for_connection` waits before giving up
    fn connect_timeout(&self) -> Option<Duration> {
        Some(DEFAULT_CONNECT_TIMEOUT)
    }

    async fn connect(&mut self, inbound: Inbound) -> Result<()>;

    async fn publish(&mut self, envelope: &Envelope) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Handle through which a broker reader pushes inbound traffic onto the channel.
#[derive(Clone)]
pub struct Inbound {
    broker: &'static str,
    channel: Channel,
    state: Arc<watch::Sender<LinkState>>,
}

impl Inbound {
    /// Decode a raw broker message and deliver it to local subscribers.
    ///
    /// A message that is not a valid envelope is logged, reported as a decode
    /// fault and dropped; the returned error lets ack-capable brokers reject it.
    pub fn deliver(&self, raw: &[u8]) -> Result<()> {
        match envelope::decode(raw) {
            Ok(env) => self.channel.publish(env),
            Err(err) => {
                error!(target: "busline::transport", broker = self.broker, error = %err, "Failed to parse inbound message");
                let message = format!("Failed to parse {} message: {}", self.broker, err);
                self.channel
                    .fault(Fault::new(FaultKind::Decode, message.clone()));
                Err(BusError::Decode(message))
            }
        }
    }

    /// The broker dropped an established link.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let changed = self.state.send_if_modified(|state| {
            if *state == LinkState::Connected {
                *state = LinkState::Disconnected;
                true
            } else {
                false
            }
        });
        if changed {
            warn!(target: "busline::transport", broker = self.broker, reason = %reason, "Connection lost");
            self.channel.fault(Fault::new(FaultKind::Broker, reason));
        }
    }

    /// The broker library re-established a dropped link.
    pub fn connection_restored(&self) {
        let changed = self.state.send_if_modified(|state| {
            if *state == LinkState::Disconnected {
                *state = LinkState::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            info!(target: "busline::transport", broker = self.broker, "Connection restored");
        }
    }

    pub fn fault(&self, fault: Fault) {
        self.channel.fault(fault);
    }

    /// True once the transport completed; reader loops should stop.
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }
}

enum Command {
    Publish(Envelope),
    SystemError(String),
    Close(oneshot::Sender<()>),
}

/// [`Transport`] implementation shared by every broker adapter.
///
/// A single owner task holds the broker exclusively. It connects as soon as
/// the transport is started, then drains one ordered command queue, so
/// publishes submitted while connecting are replayed in order.
pub struct BrokerTransport {
    name: &'static str,
    channel: Channel,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    abort_connect: Arc<Notify>,
    connect_timeout: Option<Duration>,
    closing: AtomicBool,
}

impl BrokerTransport {
    /// Start connecting `broker` in the background. Must be called from
    /// within a tokio runtime.
    pub fn start<B: Broker>(broker: B, capacity: usize) -> Self {
        let name = broker.name();
        let connect_timeout = broker.connect_timeout();
        let channel = Channel::new(capacity);
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let abort_connect = Arc::new(Notify::new());

        let owner = Owner {
            name,
            channel: channel.clone(),
            state: Arc::new(state_tx),
            abort_connect: Arc::clone(&abort_connect),
        };
        tokio::spawn(owner.run(broker, commands_rx));

        Self {
            name,
            channel,
            commands: commands_tx,
            state: state_rx,
            abort_connect,
            connect_timeout,
            closing: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        self.commands.send(command).map_err(|_| BusError::Closed)
    }
}

#[async_trait]
impl Transport for BrokerTransport {
    fn name(&self) -> &'static str {
        self.name
    }

    fn next(&self, envelope: Envelope) -> Result<()> {
        self.enqueue(Command::Publish(envelope))
    }

    fn subscribe(&self) -> Subscription {
        self.channel.subscribe()
    }

    fn error(&self, fault: Fault) {
        if self.is_connected() {
            // Fire-and-forget; a failure here must not hide the original fault
            if self.enqueue(Command::SystemError(fault.message.clone())).is_err() {
                debug!(target: "busline::transport", broker = self.name, "system_error not published; transport closing");
            }
        }
        self.channel.fault(fault);
    }

    async fn complete(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.abort_connect.notify_one();
        if self.commands.send(Command::Close(ack_tx)).is_err() {
            // Owner task already gone
            self.channel.complete();
            return;
        }
        let _ = ack_rx.await;
    }

    fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    async fn wait_for_connection(&self) -> Result<()> {
        let mut rx = self.state.clone();
        let wait = async move {
            loop {
                let outcome = match &*rx.borrow_and_update() {
                    // A later disconnect does not undo the initial connect
                    LinkState::Connected | LinkState::Disconnected => Some(Ok(())),
                    LinkState::Failed(message) => Some(Err(BusError::Connect(message.clone()))),
                    LinkState::Closed => Some(Err(BusError::Closed)),
                    LinkState::Connecting => None,
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(BusError::Closed);
                }
            }
        };
        match self.connect_timeout {
            Some(limit) => timeout(limit, wait).await.map_err(|_| {
                warn!(target: "busline::transport", broker = self.name, timeout_ms = limit.as_millis() as u64, "Timed out waiting for connection");
                BusError::ConnectTimeout(limit)
            })?,
            None => wait.await,
        }
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        // Dropping the command sender lets the owner task close the broker
        self.abort_connect.notify_one();
    }
}

struct Owner {
    name: &'static str,
    channel: Channel,
    state: Arc<watch::Sender<LinkState>>,
    abort_connect: Arc<Notify>,
}

impl Owner {
    async fn run<B: Broker>(self, mut broker: B, mut commands: mpsc::UnboundedReceiver<Command>) {
        let inbound = Inbound {
            broker: self.name,
            channel: self.channel.clone(),
            state: Arc::clone(&self.state),
        };

        info!(target: "busline::transport", broker = self.name, "Connecting");
        let connected = tokio::select! {
            res = broker.connect(inbound) => Some(res),
            _ = self.abort_connect.notified() => None,
        };

        let connect_error = match connected {
            None => {
                info!(target: "busline::transport", broker = self.name, "Closed while connecting");
                self.finish(&mut commands);
                return;
            }
            Some(Ok(())) => {
                info!(target: "busline::transport", broker = self.name, "Connected");
                self.state.send_replace(LinkState::Connected);
                None
            }
            Some(Err(err)) => {
                let message = match err {
                    BusError::Connect(message) => message,
                    other => other.to_string(),
                };
                error!(target: "busline::transport", broker = self.name, error = %message, "Failed to connect");
                self.state.send_replace(LinkState::Failed(message.clone()));
                self.channel
                    .fault(Fault::new(FaultKind::Connect, message.clone()));
                Some(message)
            }
        };

        while let Some(command) = commands.recv().await {
            match command {
                Command::Publish(env) => match &connect_error {
                    Some(message) => {
                        debug!(target: "busline::transport", broker = self.name, r#type = %env.r#type, "Dropping publish after failed connect");
                        self.channel.fault(Fault::new(FaultKind::Connect, message.clone()));
                    }
                    None => self.publish(&mut broker, &env).await,
                },
                Command::SystemError(message) => {
                    if connect_error.is_none() {
                        if let Err(err) = broker.publish(&Envelope::system_error(message)).await {
                            warn!(target: "busline::transport", broker = self.name, error = %err, "Failed to publish system_error");
                        }
                    }
                }
                Command::Close(ack) => {
                    self.shutdown(&mut broker, connect_error.is_none()).await;
                    let _ = ack.send(());
                    self.finish(&mut commands);
                    return;
                }
            }
        }

        // Every transport handle dropped without complete()
        self.shutdown(&mut broker, connect_error.is_none()).await;
    }

    async fn publish<B: Broker>(&self, broker: &mut B, env: &Envelope) {
        if let Err(err) = broker.publish(env).await {
            error!(target: "busline::transport", broker = self.name, r#type = %env.r#type, error = %err, "Failed to publish message");
            self.channel.fault(Fault::new(
                FaultKind::Publish,
                format!("Failed to publish to {}: {}", self.name, err),
            ));
        }
    }

    async fn shutdown<B: Broker>(&self, broker: &mut B, was_connected: bool) {
        if was_connected {
            if let Err(err) = broker.close().await {
                warn!(target: "busline::transport", broker = self.name, error = %err, "Error during cleanup");
            }
        }
        self.state.send_replace(LinkState::Closed);
        self.channel.complete();
        info!(target: "busline::transport", broker = self.name, "Closed");
    }

    // Acknowledge any close requests still queued so no caller waits forever
    fn finish(&self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        self.state.send_replace(LinkState::Closed);
        self.channel.complete();
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Close(ack) = command {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Signal;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording_broker(published: Arc<Mutex<Vec<String>>>) -> MockBroker {
        let mut broker = MockBroker::new();
        broker.expect_name().return_const("mock");
        broker.expect_connect_timeout().returning(|| Some(Duration::from_secs(1)));
        broker.expect_connect().returning(|_| Ok(()));
        broker.expect_publish().returning(move |env| {
            published.lock().unwrap().push(env.r#type.clone());
            Ok(())
        });
        broker.expect_close().returning(|| Ok(()));
        broker
    }

    #[tokio::test]
    async fn publishes_before_connect_are_replayed_in_order() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let transport = BrokerTransport::start(recording_broker(Arc::clone(&published)), 16);

        for ty in ["a", "b", "c"] {
            transport.next(Envelope::event(ty, json!(null))).unwrap();
        }
        transport.wait_for_connection().await.unwrap();
        transport.complete().await;

        assert_eq!(*published.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(transport.state(), LinkState::Closed);
    }

    #[tokio::test]
    async fn connect_failure_fails_waiters_and_queued_publishes() {
        let mut broker = MockBroker::new();
        broker.expect_name().return_const("mock");
        broker.expect_connect_timeout().returning(|| None);
        broker
            .expect_connect()
            .returning(|_| Err(BusError::Connect("refused".into())));
        broker.expect_publish().never();
        broker.expect_close().never();

        let transport = BrokerTransport::start(broker, 16);
        let mut sub = transport.subscribe();
        transport.next(Envelope::event("queued", json!(1))).unwrap();

        let err = transport.wait_for_connection().await.unwrap_err();
        assert!(matches!(err, BusError::Connect(ref m) if m == "refused"));
        assert_eq!(transport.state(), LinkState::Failed("refused".into()));

        let connect_fault = sub.recv_fault().await.unwrap();
        assert_eq!(connect_fault.kind, FaultKind::Connect);
        let queued_fault = sub.recv_fault().await.unwrap();
        assert_eq!(queued_fault, Fault::new(FaultKind::Connect, "refused"));
        transport.complete().await;
    }

    #[tokio::test]
    async fn publish_errors_become_faults_and_transport_keeps_going() {
        let mut broker = MockBroker::new();
        broker.expect_name().return_const("mock");
        broker.expect_connect_timeout().returning(|| None);
        broker.expect_connect().returning(|_| Ok(()));
        broker.expect_publish().returning(|env| {
            if env.r#type == "bad" {
                Err(BusError::Publish("rejected".into()))
            } else {
                Ok(())
            }
        });
        broker.expect_close().returning(|| Ok(()));

        let transport = BrokerTransport::start(broker, 16);
        transport.wait_for_connection().await.unwrap();
        let mut sub = transport.subscribe();

        transport.next(Envelope::event("bad", json!(null))).unwrap();
        let fault = sub.recv_fault().await.unwrap();
        assert_eq!(fault.kind, FaultKind::Publish);
        assert!(fault.message.contains("Failed to publish to mock"));

        assert!(transport.next(Envelope::event("good", json!(null))).is_ok());
        assert!(transport.is_connected());
        transport.complete().await;
    }

    #[tokio::test]
    async fn error_publishes_system_error_when_connected() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let transport = BrokerTransport::start(recording_broker(Arc::clone(&published)), 16);
        transport.wait_for_connection().await.unwrap();
        let mut sub = transport.subscribe();

        transport.error(Fault::new(FaultKind::Broker, "disk on fire"));
        let fault = sub.recv_fault().await.unwrap();
        assert_eq!(fault.message, "disk on fire");

        transport.complete().await;
        assert_eq!(*published.lock().unwrap(), vec!["system_error"]);
    }

    #[tokio::test]
    async fn lost_and_restored_link_is_tracked() {
        let slot: Arc<Mutex<Option<Inbound>>> = Arc::new(Mutex::new(None));
        let mut broker = MockBroker::new();
        broker.expect_name().return_const("mock");
        broker.expect_connect_timeout().returning(|| None);
        let captured = Arc::clone(&slot);
        broker.expect_connect().returning(move |inbound| {
            *captured.lock().unwrap() = Some(inbound);
            Ok(())
        });
        broker.expect_publish().returning(|_| Ok(()));
        broker.expect_close().returning(|| Ok(()));

        let transport = BrokerTransport::start(broker, 16);
        transport.wait_for_connection().await.unwrap();
        let inbound = slot.lock().unwrap().clone().unwrap();
        let mut sub = transport.subscribe();

        inbound.connection_lost("socket reset");
        assert_eq!(transport.state(), LinkState::Disconnected);
        assert!(!transport.is_connected());
        let fault = sub.recv_fault().await.unwrap();
        assert_eq!(fault, Fault::new(FaultKind::Broker, "socket reset"));

        // The initial connect already finished, so waiting returns at once
        tokio::time::timeout(Duration::from_millis(200), transport.wait_for_connection())
            .await
            .expect("wait_for_connection blocked while disconnected")
            .unwrap();

        // Repeated loss reports while down raise no extra fault
        inbound.connection_lost("socket reset");
        inbound.connection_restored();
        assert_eq!(transport.state(), LinkState::Connected);
        assert!(transport.is_connected());

        transport.next(Envelope::event("after", json!(null))).unwrap();
        transport.complete().await;
        let mut rest = Vec::new();
        while let Some(signal) = sub.recv().await {
            rest.push(signal);
        }
        assert!(matches!(rest.as_slice(), [Signal::Completed]));
    }

    #[tokio::test]
    async fn complete_closes_channel_and_rejects_next() {
        let published = Arc::new(Mutex::new(Vec::new()));
        let transport = BrokerTransport::start(recording_broker(published), 16);
        let mut sub = transport.subscribe();
        transport.wait_for_connection().await.unwrap();

        transport.complete().await;
        assert!(matches!(sub.recv().await, Some(Signal::Completed)));
        assert!(matches!(
            transport.next(Envelope::event("late", json!(null))),
            Err(BusError::Closed)
        ));
        // Second complete is a no-op
        transport.complete().await;
    }
}

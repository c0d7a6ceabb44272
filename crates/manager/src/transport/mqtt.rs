//! MQTT transport.
//!
//! All MQTT workers share one broker connection ([`MqttBroker`]). Each
//! worker owns a topic pair:
//!
//! - `udi/polyglot/<id>/poly`: worker → manager (subscribed by the manager)
//! - `udi/polyglot/<id>/node`: manager → worker, which also carries a
//!   retained `connected` / `disconnected` marker
//!
//! The connection's last-will publishes `disconnected` on the first
//! registered worker's `node` topic. A broker outage does not end any
//! session: sends fail with [`TransportError::Closed`] until the event loop
//! reconnects, after which subscriptions and markers are restored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, Publish, QoS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pg_domain::config::MqttConfig;
use pg_protocol::{topics, Frame};

use super::process::{resolve_program, ChildProcess, ProcessCommand};
use super::{EventSink, EventSource, InboundEvent, LaunchSpec, TransportError, WorkerTransport};
use crate::backoff::Backoff;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared broker connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Route {
    generation: u64,
    events: EventSink,
}

#[derive(Default)]
struct BrokerState {
    connected: AtomicBool,
    closing: AtomicBool,
    routes: parking_lot::Mutex<HashMap<String, Route>>,
}

impl BrokerState {
    fn route_for(&self, worker_id: &str) -> Option<(EventSource, EventSink)> {
        let routes = self.routes.lock();
        let route = routes.get(worker_id)?;
        Some((
            EventSource {
                worker_id: worker_id.to_string(),
                generation: route.generation,
            },
            route.events.clone(),
        ))
    }

    fn worker_ids(&self) -> Vec<String> {
        self.routes.lock().keys().cloned().collect()
    }
}

/// The manager's single connection to the MQTT broker.
pub struct MqttBroker {
    client: AsyncClient,
    state: Arc<BrokerState>,
    send_timeout: Duration,
    shutdown: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttBroker {
    /// Start the connection. The event loop connects (and reconnects) in
    /// the background; this never blocks on the broker.
    pub fn open(config: &MqttConfig, will_worker: &str, send_timeout: Duration) -> Self {
        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topics::node(will_worker),
            topics::disconnected_marker(),
            QoS::AtLeastOnce,
            true,
        ));
        if let Some(username) = &config.username {
            options.set_credentials(username.clone(), config.password().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, config.request_queue.max(1));
        let state = Arc::new(BrokerState::default());
        let shutdown = CancellationToken::new();
        let backoff = Backoff::reconnect(config);

        tracing::info!(host = %config.host, port = config.port, "connecting to MQTT broker");
        let task = tokio::spawn(drive(eventloop, client.clone(), state.clone(), backoff, shutdown.clone()));

        Self {
            client,
            state,
            send_timeout,
            shutdown,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, worker_id: &str) -> bool {
        self.state.routes.lock().contains_key(worker_id)
    }

    /// Start routing a worker's `poly` topic to `events`. Registering an id
    /// again replaces the previous generation's route.
    pub async fn register(&self, source: &EventSource, events: EventSink) -> Result<(), TransportError> {
        self.state.routes.lock().insert(
            source.worker_id.clone(),
            Route {
                generation: source.generation,
                events,
            },
        );
        // While disconnected the subscription happens on the next ConnAck.
        if self.is_connected() {
            let subscribe = self.client.subscribe(topics::poly(&source.worker_id), QoS::AtLeastOnce);
            self.bounded(subscribe).await?;
            self.publish_raw(topics::node(&source.worker_id), topics::connected_marker(), true)
                .await?;
        }
        Ok(())
    }

    /// Stop routing a worker. Returns how many workers remain registered.
    pub async fn unregister(&self, worker_id: &str) -> usize {
        let remaining = {
            let mut routes = self.state.routes.lock();
            routes.remove(worker_id);
            routes.len()
        };
        if self.is_connected() {
            let _ = self
                .publish_raw(topics::node(worker_id), topics::disconnected_marker(), true)
                .await;
            let unsubscribe = self.client.unsubscribe(topics::poly(worker_id));
            if let Err(e) = self.bounded(unsubscribe).await {
                tracing::debug!(worker_id, error = %e, "unsubscribe failed");
            }
        }
        remaining
    }

    /// Publish one frame on a worker's `node` topic.
    pub async fn publish(&self, worker_id: &str, frame: &Frame) -> Result<(), TransportError> {
        self.publish_raw(topics::node(worker_id), frame.encode(), false).await
    }

    async fn publish_raw(&self, topic: String, payload: String, retain: bool) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed("MQTT broker is not connected".into()));
        }
        self.bounded(self.client.publish(topic, QoS::AtLeastOnce, retain, payload))
            .await
    }

    async fn bounded<F>(&self, request: F) -> Result<(), TransportError>
    where
        F: std::future::Future<Output = Result<(), rumqttc::ClientError>>,
    {
        match tokio::time::timeout(self.send_timeout, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::Mqtt(e.to_string())),
            Err(_) => Err(TransportError::Closed(format!(
                "MQTT request did not complete within {:?}",
                self.send_timeout
            ))),
        }
    }

    /// Mark every remaining worker disconnected and close the connection.
    pub async fn close(&self) {
        self.state.closing.store(true, Ordering::SeqCst);
        if self.is_connected() {
            for worker_id in self.state.worker_ids() {
                let _ = self
                    .publish_raw(topics::node(&worker_id), topics::disconnected_marker(), true)
                    .await;
            }
            if let Err(e) = self.bounded(self.client.disconnect()).await {
                tracing::debug!(error = %e, "MQTT disconnect request failed");
            }
        }

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.send_timeout, &mut task).await.is_err() {
                self.shutdown.cancel();
                if tokio::time::timeout(self.send_timeout, &mut task).await.is_err() {
                    tracing::warn!("MQTT event loop did not stop, aborting it");
                    task.abort();
                }
            }
        }
        self.shutdown.cancel();
        self.state.connected.store(false, Ordering::SeqCst);
        tracing::info!("MQTT broker connection closed");
    }
}

/// Poll the event loop until shutdown: route inbound publishes, restore
/// subscriptions on every (re)connect, back off between failed attempts.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    state: Arc<BrokerState>,
    backoff: Backoff,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        let polled = tokio::select! {
            polled = eventloop.poll() => polled,
            _ = shutdown.cancelled() => break,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    tracing::warn!(code = ?ack.code, "MQTT broker refused connection");
                    continue;
                }
                attempt = 0;
                state.connected.store(true, Ordering::SeqCst);
                tracing::info!("connected to MQTT broker");
                restore_routes(&client, &state);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if !route_publish(&state, &publish, &shutdown).await {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if state.closing.load(Ordering::SeqCst) => break,
            Ok(_) => {}
            Err(e) => {
                if state.closing.load(Ordering::SeqCst) {
                    break;
                }
                if state.connected.swap(false, Ordering::SeqCst) {
                    tracing::warn!(error = %e, "lost connection to MQTT broker");
                } else {
                    tracing::debug!(error = %e, attempt, "MQTT connection attempt failed");
                }
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }
    state.connected.store(false, Ordering::SeqCst);
}

/// Queue an inbound publish for its worker. Returns `false` when the loop
/// should end: the manager is gone or the broker is closing while the
/// queue is full.
async fn route_publish(state: &BrokerState, publish: &Publish, shutdown: &CancellationToken) -> bool {
    let Some(worker_id) = topics::worker_of_poly(&publish.topic) else {
        tracing::debug!(topic = %publish.topic, "ignoring publish on unrelated topic");
        return true;
    };
    let Some((source, events)) = state.route_for(worker_id) else {
        tracing::debug!(worker_id, "ignoring publish for unregistered worker");
        return true;
    };
    let event = InboundEvent::decode(&source, &publish.payload);
    tokio::select! {
        sent = events.send(event) => sent.is_ok(),
        _ = shutdown.cancelled() => false,
    }
}

/// Runs inside the event loop task, so only non-blocking requests.
fn restore_routes(client: &AsyncClient, state: &BrokerState) {
    for worker_id in state.worker_ids() {
        if let Err(e) = client.try_subscribe(topics::poly(&worker_id), QoS::AtLeastOnce) {
            tracing::warn!(worker_id = %worker_id, error = %e, "failed to resubscribe");
        }
        if let Err(e) = client.try_publish(topics::node(&worker_id), QoS::AtLeastOnce, true, topics::connected_marker()) {
            tracing::warn!(worker_id = %worker_id, error = %e, "failed to publish connected marker");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-worker transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One worker on the shared broker connection, plus its process when the
/// supervisor launched it.
pub struct MqttTransport {
    worker_id: String,
    broker: Arc<MqttBroker>,
    process: Option<ChildProcess>,
    stopped: AtomicBool,
}

impl MqttTransport {
    pub async fn start(
        broker: Arc<MqttBroker>,
        spec: &LaunchSpec,
        events: EventSink,
        send_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let def = &spec.definition;
        let source = spec.source();
        broker.register(&source, events.clone()).await?;

        let process = match def.executable.as_deref() {
            Some(program) => {
                let command = ProcessCommand {
                    program: resolve_program(program, &spec.sandbox),
                    args: def.args.clone(),
                    env: def.env.clone(),
                    cwd: spec.sandbox.clone(),
                };
                Some(ChildProcess::spawn(&command, source, events, send_timeout)?)
            }
            None => {
                tracing::info!(worker_id = %def.id, "no executable configured, waiting for an external MQTT worker");
                None
            }
        };

        Ok(Self {
            worker_id: def.id.clone(),
            broker,
            process,
            stopped: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl WorkerTransport for MqttTransport {
    /// A launched process reads its startup frames from stdin; an external
    /// worker gets them over the broker.
    async fn bootstrap(&self, frames: &[Frame]) -> Result<(), TransportError> {
        for frame in frames {
            match &self.process {
                Some(process) => process.write_line(&frame.encode()).await?,
                None => self.send(frame).await?,
            }
        }
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("transport stopped".into()));
        }
        self.broker.publish(&self.worker_id, frame).await
    }

    fn is_alive(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.process.as_ref().map_or(true, ChildProcess::is_alive)
    }

    fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ChildProcess::pid)
    }

    fn closure_is_transient(&self) -> bool {
        true
    }

    fn is_reachable(&self) -> bool {
        self.broker.is_connected()
    }

    async fn stop(&self, timeout: Duration) -> Result<(), TransportError> {
        if let Err(e) = self.send(&Frame::bare("exit")).await {
            tracing::debug!(worker_id = %self.worker_id, error = %e, "could not publish exit frame");
        }
        self.stopped.store(true, Ordering::SeqCst);
        match &self.process {
            Some(process) => process.terminate(timeout).await,
            None => Ok(()),
        }
    }

    async fn kill(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(process) = &self.process {
            if let Err(e) = process.terminate(Duration::ZERO).await {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "failed to kill worker process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".into(),
            // Nothing listens on port 1; connects fail fast.
            port: 1,
            reconnect_initial_ms: 10,
            reconnect_max_ms: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sends_fail_closed_while_disconnected() {
        let broker = MqttBroker::open(&unreachable_config(), "hue", Duration::from_millis(200));
        assert!(!broker.is_connected());

        let err = broker.publish("hue", &Frame::bare("ping")).await.unwrap_err();
        assert!(err.is_closed());

        broker.close().await;
    }

    #[tokio::test]
    async fn full_queue_does_not_block_shutdown() {
        let state = BrokerState::default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);
        let source = EventSource {
            worker_id: "hue".into(),
            generation: 1,
        };
        tx.send(source.event(crate::transport::InboundKind::Closed { reason: "queued".into() }))
            .await
            .unwrap();
        state.routes.lock().insert(
            "hue".into(),
            Route {
                generation: 1,
                events: tx,
            },
        );

        let publish = Publish::new(topics::poly("hue"), QoS::AtLeastOnce, r#"{"pong":{}}"#);
        let shutdown = CancellationToken::new();
        let routing = route_publish(&state, &publish, &shutdown);
        tokio::pin!(routing);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut routing).await.is_err());

        shutdown.cancel();
        assert!(!routing.await);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publishes_for_unknown_workers_are_skipped() {
        let state = BrokerState::default();
        let shutdown = CancellationToken::new();
        let stray = Publish::new(topics::poly("kodi"), QoS::AtLeastOnce, r#"{"pong":{}}"#);
        assert!(route_publish(&state, &stray, &shutdown).await);
        let foreign = Publish::new("zigbee2mqtt/bridge", QoS::AtLeastOnce, "online");
        assert!(route_publish(&state, &foreign, &shutdown).await);
    }

    #[tokio::test]
    async fn registration_is_counted() {
        let broker = Arc::new(MqttBroker::open(&unreachable_config(), "a", Duration::from_millis(200)));
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        for id in ["a", "b"] {
            let source = EventSource {
                worker_id: id.into(),
                generation: 1,
            };
            broker.register(&source, tx.clone()).await.unwrap();
        }
        assert!(broker.is_registered("b"));
        assert_eq!(broker.unregister("a").await, 1);
        assert_eq!(broker.unregister("b").await, 0);
        broker.close().await;
    }
}

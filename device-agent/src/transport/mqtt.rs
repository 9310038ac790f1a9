//! MQTT transport on top of `rumqttc`.
//!
//! `new_client` connects and waits for the broker's CONNACK, then hands the
//! event loop to a background task. That task dispatches inbound publishes
//! to subscription callbacks, restores subscriptions after a reconnect and,
//! when the connection drops, asks the reconnect hook for a fresh password
//! before rumqttc dials again.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use shared::{
    constants::MQTT_CHANNEL_CAPACITY,
    error::{AgentError, AgentResult},
};

use super::{
    topic_matches, InboundMessage, MessageCallback, PublishRequest, ReconnectHook, SessionDescriptor,
    SubscribeRequest, Transport,
};

/// Pause before rumqttc redials after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Subscription {
    filter: String,
    qos: QoS,
    callback: MessageCallback,
}

type Subscriptions = Arc<RwLock<Vec<Subscription>>>;

/// A live connection and its event loop task
struct MqttSession {
    client: AsyncClient,
    subscriptions: Subscriptions,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// [`Transport`] speaking MQTT 3.1.1
pub struct MqttTransport {
    session: Mutex<Option<MqttSession>>,
    channel_capacity: usize,
}

impl Default for MqttTransport {
    fn default() -> Self {
        Self::new(MQTT_CHANNEL_CAPACITY)
    }
}

impl MqttTransport {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            session: Mutex::new(None),
            channel_capacity,
        }
    }

    fn client(&self) -> AgentResult<(AsyncClient, Subscriptions)> {
        self.session
            .lock()
            .as_ref()
            .map(|s| (s.client.clone(), Arc::clone(&s.subscriptions)))
            .ok_or_else(|| AgentError::session("mqtt", "no session open"))
    }

    /// Poll until the broker accepts or refuses the connection
    async fn await_connack(eventloop: &mut EventLoop) -> AgentResult<()> {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(AgentError::session("connect", format!("broker refused: {:?}", ack.code)))
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(AgentError::session("connect", e)),
            }
        }
    }
}

fn to_qos(qos: u8) -> AgentResult<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(AgentError::InvalidRequest(format!("invalid QoS {}", other))),
    }
}

fn dispatch(subscriptions: &Subscriptions, message: InboundMessage) {
    let callbacks: Vec<MessageCallback> = subscriptions
        .read()
        .iter()
        .filter(|s| topic_matches(&s.filter, &message.topic))
        .map(|s| Arc::clone(&s.callback))
        .collect();

    if callbacks.is_empty() {
        debug!(topic = %message.topic, "No subscription for inbound message");
    }
    for callback in callbacks {
        callback(message.clone());
    }
}

/// Replace the subscription for the same filter, returning the replaced one
fn install_subscription(subscriptions: &Subscriptions, subscription: Subscription) -> Option<Subscription> {
    let mut subscriptions = subscriptions.write();
    let previous = subscriptions
        .iter()
        .position(|s| s.filter == subscription.filter)
        .map(|index| subscriptions.remove(index));
    subscriptions.push(subscription);
    previous
}

/// Drive the event loop until shutdown
async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Subscriptions,
    username: String,
    reconnect: Option<Arc<dyn ReconnectHook>>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                dispatch(
                    &subscriptions,
                    InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    },
                );
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("MQTT session re-established");
                for s in subscriptions.read().iter() {
                    if let Err(e) = client.try_subscribe(s.filter.clone(), s.qos) {
                        warn!(topic = %s.filter, error = %e, "Failed to restore subscription");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection lost");
                if let Some(hook) = &reconnect {
                    match hook.refresh_password().await {
                        Ok(password) => {
                            eventloop.mqtt_options.set_credentials(username.clone(), password);
                            debug!("Session password refreshed for reconnect");
                        }
                        Err(e) => warn!(error = %e, "Could not refresh session password"),
                    }
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    debug!("MQTT event loop stopped");
}

#[async_trait]
impl Transport for MqttTransport {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn new_client(&self, descriptor: SessionDescriptor) -> AgentResult<()> {
        descriptor.validate()?;
        let (host, port) = descriptor.host_port()?;

        let mut options = MqttOptions::new(descriptor.client_id.clone(), host.clone(), port);
        options.set_keep_alive(descriptor.keep_alive);
        if !descriptor.username.is_empty() {
            options.set_credentials(descriptor.username.clone(), descriptor.password.clone());
        }

        // Replace any previous session before dialing again
        if let Some(old) = self.session.lock().take() {
            debug!("Dropping previous MQTT session");
            drop(old);
        }

        info!(host = %host, port, client_id = %descriptor.client_id, "Connecting MQTT session");

        let (client, mut eventloop) = AsyncClient::new(options, self.channel_capacity);
        Self::await_connack(&mut eventloop).await?;

        let subscriptions: Subscriptions = Arc::new(RwLock::new(Vec::new()));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&subscriptions),
            descriptor.username,
            descriptor.reconnect,
            shutdown.clone(),
        ));

        *self.session.lock() = Some(MqttSession {
            client,
            subscriptions,
            shutdown,
            task,
        });

        info!(host = %host, port, "MQTT session established");
        Ok(())
    }

    async fn publish(&self, request: PublishRequest) -> AgentResult<()> {
        let qos = to_qos(request.qos)?;
        let (client, _) = self.client()?;
        client
            .publish(request.topic, qos, request.retained, request.payload)
            .await
            .map_err(|e| AgentError::session("publish", e))
    }

    async fn subscribe(&self, request: SubscribeRequest) -> AgentResult<()> {
        let qos = to_qos(request.qos)?;
        let (client, subscriptions) = self.client()?;

        // Registered before SUBSCRIBE goes out so early retained messages find it
        let previous = install_subscription(
            &subscriptions,
            Subscription {
                filter: request.topic.clone(),
                qos,
                callback: request.callback,
            },
        );

        if let Err(e) = client.subscribe(request.topic.clone(), qos).await {
            let mut subscriptions = subscriptions.write();
            subscriptions.retain(|s| s.filter != request.topic);
            subscriptions.extend(previous);
            return Err(AgentError::session("subscribe", e));
        }
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> AgentResult<()> {
        let (client, subscriptions) = self.client()?;
        for topic in topics {
            client
                .unsubscribe(topic.clone())
                .await
                .map_err(|e| AgentError::session("unsubscribe", e))?;
        }
        subscriptions.write().retain(|s| !topics.contains(&s.filter));
        Ok(())
    }

    fn has_instance(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    async fn close(&self) -> AgentResult<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            if let Err(e) = session.client.disconnect().await {
                error!(error = %e, "MQTT disconnect failed");
            }
            info!("MQTT session closed");
        }
        Ok(())
    }
}

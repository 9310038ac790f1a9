//! # Messaging Facade
//!
//! Builds the three application message shapes on top of the session:
//! - post-property: state report, QoS 1, not retained
//! - post-event: occurrence report, QoS 1, not retained
//! - on-command: one subscription whose dispatcher routes decoded commands
//!   to handlers by numeric id

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use shared::{
    constants::{SUB_DEVICE_PARAM_KEY, TELEMETRY_QOS},
    error::AgentResult,
    types::{CommandParams, Property, Topics, Value},
};

use crate::serializer::Serializer;
use crate::session::{Request, SessionManager};
use crate::transport::{InboundMessage, MessageCallback};

/// Handler for one command id
pub type CommandHandler = Arc<dyn Fn(CommandParams) + Send + Sync>;

/// Command id → handler. Immutable once handed to `on_command`.
#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: HashMap<u16, CommandHandler>,
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("CommandTable").field("ids", &ids).finish()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for command `id`, replacing any earlier one
    pub fn on<F>(mut self, id: u16, handler: F) -> Self
    where
        F: Fn(CommandParams) + Send + Sync + 'static,
    {
        self.handlers.insert(id, Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, id: u16) -> Option<&CommandHandler> {
        self.handlers.get(&id)
    }
}

/// What happened to one inbound command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran
    Handled(u16),
    /// No handler registered for the id
    Unhandled(u16),
    /// The payload could not be decoded
    Malformed,
}

/// Decode `payload` and run the matching handler.
///
/// The sub-device id is delivered inside the parameters under
/// [`SUB_DEVICE_PARAM_KEY`].
pub fn dispatch_command(serializer: &dyn Serializer, table: &CommandTable, payload: &[u8]) -> Dispatch {
    let command = match serializer.unmarshal_command(payload) {
        Ok(command) => command,
        Err(e) => {
            warn!(error = %e, bytes = payload.len(), "Dropping undecodable command");
            return Dispatch::Malformed;
        }
    };

    let Some(handler) = table.get(command.id) else {
        debug!(command = command.id, "No handler for command");
        return Dispatch::Unhandled(command.id);
    };

    let mut params = command.params;
    params.insert(SUB_DEVICE_PARAM_KEY, Value::String(command.sub_device_id));
    handler(params);
    Dispatch::Handled(command.id)
}

/// Telemetry and command exchange over an open session
pub struct MessagingFacade {
    session: Arc<SessionManager>,
    serializer: Arc<dyn Serializer>,
    topics: Topics,
}

impl MessagingFacade {
    pub fn new(session: Arc<SessionManager>, serializer: Arc<dyn Serializer>, topics: Topics) -> Self {
        Self {
            session,
            serializer,
            topics,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Report a property on the post-property topic
    pub async fn post_property(&self, property: &Property) -> AgentResult<()> {
        let payload = self.serializer.make_property_payload(property)?;
        debug!(property = property.property_id, "Posting property");
        self.session
            .publish(Request::publish(&self.topics.post_property, TELEMETRY_QOS, payload))
            .await
    }

    /// Report an event on the post-event topic; `identifier` travels in the payload
    pub async fn post_event(&self, identifier: &str, property: &Property) -> AgentResult<()> {
        let payload = self.serializer.make_event_payload(identifier, property)?;
        debug!(event = %identifier, property = property.property_id, "Posting event");
        self.session
            .publish(Request::publish(&self.topics.post_event, TELEMETRY_QOS, payload))
            .await
    }

    /// Subscribe to the command topic and route commands through `table`.
    ///
    /// Calling it again replaces the previous table.
    pub async fn on_command(&self, table: CommandTable) -> AgentResult<()> {
        debug!(table = ?table, "Registering command handlers");

        let table = Arc::new(table);
        let serializer = Arc::clone(&self.serializer);
        let callback: MessageCallback = Arc::new(move |message: InboundMessage| {
            dispatch_command(serializer.as_ref(), &table, &message.payload);
        });

        self.session
            .subscribe(Request::subscribe(&self.topics.on_command, TELEMETRY_QOS, callback))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use crate::testing::MockTransport;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn facade() -> (Arc<MockTransport>, MessagingFacade) {
        let transport = Arc::new(MockTransport::new());
        let session = Arc::new(SessionManager::new(transport.clone(), Duration::from_secs(30)));
        let facade = MessagingFacade::new(session, Arc::new(JsonSerializer), Topics::default());
        (transport, facade)
    }

    fn recording_table(id: u16) -> (Arc<Mutex<Vec<CommandParams>>>, CommandTable) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let table = CommandTable::new().on(id, move |params| sink.lock().push(params));
        (seen, table)
    }

    #[tokio::test]
    async fn test_post_property_publishes_qos1_not_retained() {
        let (transport, facade) = facade();
        let property = Property::new(1, vec![Value::Int(20)]);

        facade.post_property(&property).await.unwrap();

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, Topics::default().post_property);
        assert_eq!(published[0].qos, 1);
        assert!(!published[0].retained);
        assert_eq!(
            published[0].payload,
            JsonSerializer.make_property_payload(&property).unwrap()
        );
    }

    #[tokio::test]
    async fn test_post_event_targets_event_topic() {
        let (transport, facade) = facade();
        facade
            .post_event("door-open", &Property::new(2, vec![Value::Bool(true)]))
            .await
            .unwrap();

        let published = transport.published();
        assert_eq!(published[0].topic, Topics::default().post_event);
        let json: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(json["identifier"], "door-open");
    }

    #[tokio::test]
    async fn test_serialization_failure_is_surfaced() {
        let (transport, facade) = facade();
        let err = facade
            .post_event("", &Property::new(2, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "serialization");
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_surfaced() {
        let (transport, facade) = facade();
        transport.fail_publishes(true);
        let err = facade
            .post_property(&Property::new(1, vec![Value::Int(1)]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "session");
    }

    #[test]
    fn test_dispatch_injects_sub_device_id() {
        let (seen, table) = recording_table(7);

        let outcome = dispatch_command(
            &JsonSerializer,
            &table,
            br#"{"id":7,"subDeviceId":"sub1","params":{"0":"x"}}"#,
        );

        assert_eq!(outcome, Dispatch::Handled(7));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get(&0), Some(&Value::String("x".into())));
        assert_eq!(seen[0].get(&SUB_DEVICE_PARAM_KEY), Some(&Value::String("sub1".into())));
        assert_eq!(seen[0].len(), 2);
    }

    #[test]
    fn test_dispatch_drops_unknown_and_malformed() {
        let (seen, table) = recording_table(7);

        assert_eq!(
            dispatch_command(&JsonSerializer, &table, br#"{"id":8,"params":{}}"#),
            Dispatch::Unhandled(8)
        );
        assert_eq!(
            dispatch_command(&JsonSerializer, &table, b"garbage"),
            Dispatch::Malformed
        );
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_on_command_survives_bad_messages() {
        let (transport, facade) = facade();
        let (seen, table) = recording_table(7);

        facade.on_command(table).await.unwrap();
        let topic = Topics::default().on_command;
        assert_eq!(transport.subscribed_topics(), vec![topic.clone()]);

        transport.deliver(&topic, b"not json".to_vec());
        transport.deliver(&topic, br#"{"id":9,"params":{}}"#.to_vec());
        transport.deliver(&topic, br#"{"id":7,"subDeviceId":"","params":{"1":5}}"#.to_vec());

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get(&1), Some(&Value::Int(5)));
    }

    #[tokio::test]
    async fn test_on_command_again_replaces_table() {
        let (transport, facade) = facade();
        let (first, table_a) = recording_table(7);
        let (second, table_b) = recording_table(8);

        facade.on_command(table_a).await.unwrap();
        facade.on_command(table_b).await.unwrap();

        let topic = Topics::default().on_command;
        transport.deliver(&topic, br#"{"id":7,"params":{}}"#.to_vec());
        transport.deliver(&topic, br#"{"id":8,"params":{}}"#.to_vec());

        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);
    }
}

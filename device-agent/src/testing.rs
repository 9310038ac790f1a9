//! In-process doubles for the storage, HTTP and transport capabilities.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use shared::error::{AgentError, AgentResult};

use crate::http::{HttpClient, HttpResponse};
use crate::storage::Storage;
use crate::transport::{
    topic_matches, InboundMessage, MessageCallback, PublishRequest, ReconnectHook, SessionDescriptor,
    SubscribeRequest, Transport,
};

// =============================================================================
// STORAGE
// =============================================================================

/// Storage whose every operation fails
pub struct FailingStorage;

#[async_trait]
impl Storage for FailingStorage {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        Err(AgentError::StorageError(format!("cannot read {}", key)))
    }

    async fn set(&self, key: &str, _value: &str) -> AgentResult<()> {
        Err(AgentError::StorageError(format!("cannot write {}", key)))
    }
}

// =============================================================================
// HTTP
// =============================================================================

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Replays queued responses per URL and records every request
#[derive(Default)]
pub struct MockHttp {
    responses: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockHttp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a 200 response with a JSON body
    pub fn respond_json(&self, url: &str, body: serde_json::Value) {
        self.respond_raw(url, 200, body.to_string().into_bytes());
    }

    pub fn respond_raw(&self, url: &str, status: u16, body: Vec<u8>) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(HttpResponse { status, body });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl HttpClient for MockHttp {
    async fn post(&self, url: &str, content_type: &str, body: Vec<u8>) -> AgentResult<HttpResponse> {
        self.requests.lock().push(RecordedRequest {
            url: url.to_string(),
            content_type: content_type.to_string(),
            body,
        });

        self.responses
            .lock()
            .get_mut(url)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| AgentError::HttpError {
                url: url.to_string(),
                reason: "connection refused".into(),
            })
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Default)]
struct TransportState {
    live: bool,
    connects: usize,
    failing_connects: usize,
    failing_publishes: bool,
    last_descriptor: Option<SessionDescriptor>,
    published: Vec<PublishRequest>,
    subscriptions: Vec<(String, MessageCallback)>,
}

/// Records transport calls; subscriptions are delivered synchronously
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<TransportState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_descriptor(&self) -> Option<SessionDescriptor> {
        self.state.lock().last_descriptor.clone()
    }

    pub fn published(&self) -> Vec<PublishRequest> {
        self.state.lock().published.clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state.lock().subscriptions.iter().map(|(t, _)| t.clone()).collect()
    }

    /// Number of `new_client` calls, failed ones included
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    pub fn set_live(&self, live: bool) {
        self.state.lock().live = live;
    }

    /// Make the next `n` calls to `new_client` fail
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().failing_connects = n;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().failing_publishes = fail;
    }

    /// Hand `payload` to every subscription matching `topic`
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let callbacks: Vec<MessageCallback> = self
            .state
            .lock()
            .subscriptions
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, cb)| cb.clone())
            .collect();

        for callback in callbacks {
            callback(InboundMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn new_client(&self, descriptor: SessionDescriptor) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AgentError::session("connect", "broker unreachable"));
        }
        state.last_descriptor = Some(descriptor);
        state.live = true;
        Ok(())
    }

    async fn publish(&self, request: PublishRequest) -> AgentResult<()> {
        let mut state = self.state.lock();
        if state.failing_publishes {
            return Err(AgentError::session("publish", "outbound queue closed"));
        }
        state.published.push(request);
        Ok(())
    }

    async fn subscribe(&self, request: SubscribeRequest) -> AgentResult<()> {
        let mut state = self.state.lock();
        state.subscriptions.retain(|(topic, _)| *topic != request.topic);
        state.subscriptions.push((request.topic, request.callback));
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> AgentResult<()> {
        self.state
            .lock()
            .subscriptions
            .retain(|(topic, _)| !topics.contains(topic));
        Ok(())
    }

    fn has_instance(&self) -> bool {
        self.state.lock().live
    }

    async fn close(&self) -> AgentResult<()> {
        self.state.lock().live = false;
        Ok(())
    }
}

/// Reconnect hook returning a fixed password
pub struct StaticPassword(pub String);

#[async_trait]
impl ReconnectHook for StaticPassword {
    async fn refresh_password(&self) -> AgentResult<String> {
        Ok(self.0.clone())
    }
}

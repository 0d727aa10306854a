//! Scripted transport shared by the client tests.

use crate::api::{RpcRequest, RpcResponse};
use crate::client::rpc::AdminTransport;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub endpoint: String,
    pub request: RpcRequest,
}

type Scripted = Result<RpcResponse, String>;

/// Answers by resource. Queued answers are used once each, then the
/// `always` answer (or an empty success) takes over.
#[derive(Default)]
pub struct ScriptedTransport {
    calls: Mutex<Vec<RecordedCall>>,
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    always: Mutex<HashMap<String, Scripted>>,
    offline: Mutex<HashSet<String>>,
    holds: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, resource: &str, answer: Scripted) {
        self.queued
            .lock()
            .entry(resource.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn respond_always(&self, resource: &str, answer: Scripted) {
        self.always.lock().insert(resource.to_string(), answer);
    }

    /// Every call to `endpoint` fails at the transport level.
    pub fn set_offline(&self, endpoint: &str, offline: bool) {
        let mut set = self.offline.lock();
        if offline {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Calls to `resource` wait until the returned handle is notified.
    pub fn hold(&self, resource: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.holds.lock().insert(resource.to_string(), notify.clone());
        notify
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, resource: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.request.resource == resource)
            .collect()
    }
}

#[async_trait::async_trait]
impl AdminTransport for ScriptedTransport {
    async fn send(&self, endpoint: &str, request: &RpcRequest) -> Result<RpcResponse, String> {
        self.calls.lock().push(RecordedCall {
            endpoint: endpoint.to_string(),
            request: request.clone(),
        });

        let hold = self.holds.lock().get(&request.resource).cloned();
        if let Some(notify) = hold {
            notify.notified().await;
        }

        if self.offline.lock().contains(endpoint) {
            return Err(format!("error sending request for url ({})", endpoint));
        }

        let queued = self
            .queued
            .lock()
            .get_mut(&request.resource)
            .and_then(|q| q.pop_front());
        if let Some(answer) = queued {
            return answer;
        }
        if let Some(answer) = self.always.lock().get(&request.resource) {
            return answer.clone();
        }
        Ok(RpcResponse::ok(&request.resource, serde_json::json!({})))
    }
}

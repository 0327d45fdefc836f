use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::rpc::{
    DispatchResponse, TaskControlRequest, TaskDispatchRequest, TaskEventSource, TaskStateEvent,
    WorkerClient,
};

/// Envelope pushed onto a worker's inbox list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Dispatch(TaskDispatchRequest),
    Control(TaskControlRequest),
}

fn classify(host: &str, error: redis::RedisError) -> RpcError {
    if error.is_timeout() {
        RpcError::Timeout { host: host.to_string() }
    } else if error.is_connection_refusal() {
        RpcError::ConnectionRefused { host: host.to_string() }
    } else {
        RpcError::Redis(error)
    }
}

/// Sends worker messages by pushing them onto `{prefix}:worker:{host}:inbox`.
/// Delivery is accepted once the push succeeds; the worker reports progress through
/// the master event list.
pub struct RedisWorkerClient {
    client: redis::Client,
    key_prefix: String,
}

impl RedisWorkerClient {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
        }
    }

    pub fn inbox_key(&self, host: &str) -> String {
        format!("{}:worker:{}:inbox", self.key_prefix, host)
    }

    async fn push(&self, host: &str, message: &WorkerMessage) -> Result<(), RpcError> {
        let serialized = serde_json::to_string(message)?;
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| classify(host, e))?;
        let _: () = conn
            .lpush(self.inbox_key(host), serialized)
            .await
            .map_err(|e| classify(host, e))?;
        Ok(())
    }
}

#[async_trait]
impl WorkerClient for RedisWorkerClient {
    async fn dispatch(&self, host: &str, request: TaskDispatchRequest) -> Result<DispatchResponse, RpcError> {
        self.push(host, &WorkerMessage::Dispatch(request)).await?;
        Ok(DispatchResponse::accepted())
    }

    async fn control(&self, host: &str, request: TaskControlRequest) -> Result<(), RpcError> {
        self.push(host, &WorkerMessage::Control(request)).await
    }
}

/// Pops worker reported task events from `{prefix}:master:events`.
pub struct RedisTaskEventSource {
    client: redis::Client,
    events_key: String,
}

impl RedisTaskEventSource {
    pub fn new(client: redis::Client, key_prefix: &str) -> Self {
        Self {
            client,
            events_key: format!("{}:master:events", key_prefix),
        }
    }

    pub fn events_key(&self) -> &str {
        &self.events_key
    }
}

#[async_trait]
impl TaskEventSource for RedisTaskEventSource {
    async fn next_event(&self) -> Result<Option<TaskStateEvent>, RpcError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // 1 second timeout keeps the caller responsive to shutdown.
        let result: Option<(String, String)> = conn.brpop(&self.events_key, 1.0).await?;

        match result {
            Some((_, event_json)) => Ok(Some(serde_json::from_str(&event_json)?)),
            None => Ok(None),
        }
    }
}

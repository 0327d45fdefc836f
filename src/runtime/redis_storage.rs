use async_trait::async_trait;
use anyhow::Result;
use redis::AsyncCommands;

use crate::model::Command;
use crate::runtime::storage::CommandQueue;

/// Command queue shared by every master, kept in a Redis list.
pub struct RedisCommandQueue {
    client: redis::Client,
    queue_key: String,
}

impl RedisCommandQueue {
    pub fn new(client: redis::Client, key_prefix: &str) -> Self {
        Self {
            client,
            queue_key: format!("{}:commands", key_prefix),
        }
    }
}

#[async_trait]
impl CommandQueue for RedisCommandQueue {
    async fn push(&self, command: Command) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(&command)?;
        let _: () = conn.lpush(&self.queue_key, serialized).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Command>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // 1 second timeout keeps the command loop responsive to shutdown.
        let result: Option<(String, String)> = conn.brpop(&self.queue_key, 1.0).await?;

        match result {
            Some((_, command_json)) => Ok(Some(serde_json::from_str(&command_json)?)),
            None => Ok(None),
        }
    }
}
